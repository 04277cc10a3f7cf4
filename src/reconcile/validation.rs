use std::fmt;

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::content::ContentResolver;
use crate::chain::curation::{parse_content_uri, to_human_amount, CurationEvent};
use crate::config::ChainConfig;
use crate::error::AppResult;
use crate::ledger::models::Transaction;

/// Why a curation event cannot be credited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    ZeroCreator,
    UnknownCreator,
    UnparseableUri,
    UnknownContent,
    UnknownToken,
    AmountOverflow,
    /// Successful receipt without a curation event from the contract
    MissingCurationEvent,
    RecipientMismatch,
    CurrencyMismatch,
    AmountMismatch,
    TargetMismatch,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            InvalidReason::ZeroCreator => "creator is the zero address",
            InvalidReason::UnknownCreator => "creator is not a platform user",
            InvalidReason::UnparseableUri => "content uri cannot be parsed",
            InvalidReason::UnknownContent => "content reference is unknown",
            InvalidReason::UnknownToken => "token is not accepted on this chain",
            InvalidReason::AmountOverflow => "amount does not fit the token decimals",
            InvalidReason::MissingCurationEvent => "no curation event in receipt",
            InvalidReason::RecipientMismatch => "creator is not the expected recipient",
            InvalidReason::CurrencyMismatch => "currency differs from the expected payment",
            InvalidReason::AmountMismatch => "amount differs from the expected payment",
            InvalidReason::TargetMismatch => "content differs from the expected target",
        };
        write!(f, "{}", reason)
    }
}

/// What an event pays for, once the ledger-independent checks passed
#[derive(Debug, Clone, PartialEq)]
pub struct ScreenedPayment {
    pub content_id: Uuid,
    pub currency: String,
    /// Human units
    pub amount: Decimal,
}

/// Checks that need no ledger transaction: creator address, content
/// reference and token. Run before opening one, since the content resolver
/// may use the same database.
pub async fn screen_event(
    config: &ChainConfig,
    content: &dyn ContentResolver,
    event: &CurationEvent,
) -> AppResult<Result<ScreenedPayment, InvalidReason>> {
    if event.creator == Address::ZERO {
        return Ok(Err(InvalidReason::ZeroCreator));
    }

    let Some(reference) = parse_content_uri(&event.uri) else {
        return Ok(Err(InvalidReason::UnparseableUri));
    };

    let Some(content_id) = content.resolve_content_reference(reference).await? else {
        return Ok(Err(InvalidReason::UnknownContent));
    };

    let Some(token) = config.token_by_address(event.token) else {
        return Ok(Err(InvalidReason::UnknownToken));
    };

    let Some(amount) = to_human_amount(event.amount, token.decimals) else {
        return Ok(Err(InvalidReason::AmountOverflow));
    };

    Ok(Ok(ScreenedPayment {
        content_id,
        currency: token.symbol.clone(),
        amount,
    }))
}

/// Compare a screened event with the payment a pending transaction expects.
/// `recipient_address` is the chain address on file for the recipient.
pub fn check_expected_payment(
    expected: &Transaction,
    recipient_address: Option<&str>,
    event: &CurationEvent,
    payment: &ScreenedPayment,
) -> Result<(), InvalidReason> {
    let recipient = recipient_address.and_then(|address| address.parse::<Address>().ok());
    if recipient != Some(event.creator) {
        return Err(InvalidReason::RecipientMismatch);
    }

    if !expected.currency.eq_ignore_ascii_case(&payment.currency) {
        return Err(InvalidReason::CurrencyMismatch);
    }

    if expected.amount != payment.amount {
        return Err(InvalidReason::AmountMismatch);
    }

    if let Some(target_id) = expected.target_id {
        if target_id != payment.content_id {
            return Err(InvalidReason::TargetMismatch);
        }
    }

    Ok(())
}
