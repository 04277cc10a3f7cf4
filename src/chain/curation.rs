//! Decoding of the curation contract's `Curation` events.
//!
//! The contract emits one of two shapes depending on what was paid:
//!
//! ```text
//! Curation(address indexed from, address indexed to, address indexed token, string uri, uint256 amount)
//! Curation(address indexed from, address indexed to, string uri, uint256 amount)
//! ```
//!
//! `from` is the curator paying, `to` the creator being paid. The second
//! shape is used for the chain's native coin.

use alloy::primitives::{Address, Log, B256, U256};
use alloy::sol_types::SolEvent;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

use super::RawLog;

mod erc20 {
    alloy::sol! {
        event Curation(address indexed from, address indexed to, address indexed token, string uri, uint256 amount);
    }
}

mod native {
    alloy::sol! {
        event Curation(address indexed from, address indexed to, string uri, uint256 amount);
    }
}

pub use erc20::Curation as Erc20Curation;
pub use native::Curation as NativeCuration;

/// Topic0 of both curation shapes, for log filters
pub fn curation_topics() -> Vec<B256> {
    vec![Erc20Curation::SIGNATURE_HASH, NativeCuration::SIGNATURE_HASH]
}

/// A decoded curation event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurationEvent {
    pub curator: Address,
    pub creator: Address,
    /// ERC-20 token contract, `None` for native coin
    pub token: Option<Address>,
    pub uri: String,
    /// Amount in token base units
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("log is not a curation event")]
    UnknownTopic,
    #[error("unexpected topic count {0}")]
    TopicCount(usize),
    #[error("malformed abi data: {0}")]
    Abi(String),
    #[error("amount does not fit a decimal")]
    AmountOverflow,
}

fn decode_event<E: SolEvent>(log: &RawLog) -> Result<E, DecodeError> {
    let log = Log::new(log.address, log.topics.clone(), log.data.clone())
        .ok_or(DecodeError::TopicCount(log.topics.len()))?;
    E::decode_log(&log)
        .map(|decoded| decoded.data)
        .map_err(|e| DecodeError::Abi(e.to_string()))
}

fn to_decimal(amount: U256) -> Result<Decimal, DecodeError> {
    let amount = u128::try_from(amount).map_err(|_| DecodeError::AmountOverflow)?;
    Decimal::from_u128(amount).ok_or(DecodeError::AmountOverflow)
}

/// Decode a curation log. The caller is responsible for checking that the
/// log was emitted by the curation contract.
pub fn decode_curation_log(log: &RawLog) -> Result<CurationEvent, DecodeError> {
    let topic0 = log.topics.first().ok_or(DecodeError::UnknownTopic)?;

    if *topic0 == Erc20Curation::SIGNATURE_HASH {
        if log.topics.len() != 4 {
            return Err(DecodeError::TopicCount(log.topics.len()));
        }
        let event = decode_event::<Erc20Curation>(log)?;
        Ok(CurationEvent {
            curator: event.from,
            creator: event.to,
            token: Some(event.token),
            amount: to_decimal(event.amount)?,
            uri: event.uri,
        })
    } else if *topic0 == NativeCuration::SIGNATURE_HASH {
        if log.topics.len() != 3 {
            return Err(DecodeError::TopicCount(log.topics.len()));
        }
        let event = decode_event::<NativeCuration>(log)?;
        Ok(CurationEvent {
            curator: event.from,
            creator: event.to,
            token: None,
            amount: to_decimal(event.amount)?,
            uri: event.uri,
        })
    } else {
        Err(DecodeError::UnknownTopic)
    }
}

/// Content id of an `ipfs://<cid>` uri
pub fn parse_content_uri(uri: &str) -> Option<&str> {
    let cid = uri.strip_prefix("ipfs://")?;
    if cid.is_empty() || !cid.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(cid)
}

/// Shift a base-unit amount into human units, e.g. 1500000 with 6 decimals is 1.5
pub fn to_human_amount(base_units: Decimal, decimals: u32) -> Option<Decimal> {
    let mut amount = base_units;
    amount.set_scale(decimals).ok()?;
    Some(amount.normalize())
}
