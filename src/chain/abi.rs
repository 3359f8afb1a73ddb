//! Contract ABI surface: event topics, log decoding and `executePayout` calldata.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use super::{LedgerEvent, LedgerEventKind};
use crate::error::LedgerError;

/// keccak256("PolicyPurchased(address,uint256,uint256,uint256,uint256)")
pub const POLICY_PURCHASED_TOPIC: &str =
    "0x8e63e251f17c4f8c8dd082b9641ba8a3a04d5506e4a1b1782c6e3f57abc39374";

/// keccak256("PayoutExecuted(address,uint256,uint256)")
pub const PAYOUT_EXECUTED_TOPIC: &str =
    "0x63f55f28cc9b6363ecdbaa936809f86425d5709291a6d3e58910f0d9fc4b390f";

/// First four bytes of keccak256("executePayout(address,uint256,string)")
pub const EXECUTE_PAYOUT_SELECTOR: [u8; 4] = [0xd5, 0x70, 0x56, 0xdc];

const WORD: usize = 32;

/// Log object as returned by `eth_getLogs`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub block_number: String,
    pub transaction_hash: String,
    pub log_index: String,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub block_timestamp: Option<String>,
}

/// Hex quantity ("0x1a") to integer
pub fn parse_quantity(raw: &str) -> Result<u64, LedgerError> {
    u64::from_str_radix(raw.trim_start_matches("0x"), 16)
        .map_err(|e| LedgerError::Decode(format!("Invalid quantity {}: {}", raw, e)))
}

fn decode_hex(raw: &str) -> Result<Vec<u8>, LedgerError> {
    hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| LedgerError::Decode(format!("Invalid hex data: {}", e)))
}

fn word(data: &[u8], index: usize) -> Result<&[u8], LedgerError> {
    data.get(index * WORD..(index + 1) * WORD).ok_or_else(|| {
        LedgerError::Decode(format!(
            "Log data too short: {} bytes, need word {}",
            data.len(),
            index
        ))
    })
}

fn word_to_u128(word: &[u8]) -> Result<u128, LedgerError> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(LedgerError::Decode("uint256 value exceeds 128 bits".to_string()));
    }
    let low: [u8; 16] = word[16..WORD]
        .try_into()
        .map_err(|_| LedgerError::Decode("Malformed uint256 word".to_string()))?;
    Ok(u128::from_be_bytes(low))
}

fn word_to_i64(word: &[u8]) -> Result<i64, LedgerError> {
    let value = word_to_u128(word)?;
    i64::try_from(value).map_err(|_| LedgerError::Decode(format!("Value {} exceeds i64", value)))
}

/// Base units to a Decimal with `decimals` fractional digits, no floating point
pub fn scale_amount(base_units: u128, decimals: u32) -> Result<Decimal, LedgerError> {
    let units = i128::try_from(base_units)
        .map_err(|_| LedgerError::Decode(format!("Amount {} out of range", base_units)))?;
    Decimal::try_from_i128_with_scale(units, decimals)
        .map(|d| d.normalize())
        .map_err(|e| LedgerError::Decode(format!("Amount {} not representable: {}", base_units, e)))
}

fn address_from_topic(topic: &str) -> Result<String, LedgerError> {
    let hex = topic.trim_start_matches("0x");
    if hex.len() != 2 * WORD {
        return Err(LedgerError::Decode(format!("Invalid address topic {}", topic)));
    }
    Ok(format!("0x{}", hex[24..].to_lowercase()))
}

pub fn unix_time(seconds: i64) -> Result<DateTime<Utc>, LedgerError> {
    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| LedgerError::Decode(format!("Invalid timestamp {}", seconds)))
}

/// Decode a purchase or settlement log of the insurance pool contract
pub fn decode_log(raw: &RawLog, decimals: u32) -> Result<LedgerEvent, LedgerError> {
    let topic0 = raw
        .topics
        .first()
        .ok_or_else(|| LedgerError::Decode("Log has no topics".to_string()))?
        .to_lowercase();
    let holder = address_from_topic(
        raw.topics
            .get(1)
            .ok_or_else(|| LedgerError::Decode("Log has no holder topic".to_string()))?,
    )?;
    let data = decode_hex(&raw.data)?;

    let block_height = parse_quantity(&raw.block_number)?;
    let log_index = parse_quantity(&raw.log_index)?;
    let block_time = match raw.block_timestamp.as_deref() {
        Some(ts) => Some(unix_time(parse_quantity(ts)? as i64)?),
        None => None,
    };

    let (kind, policy_ref, amount) = if topic0 == POLICY_PURCHASED_TOPIC {
        let policy_ref = word_to_i64(word(&data, 0)?)?;
        let premium = scale_amount(word_to_u128(word(&data, 1)?)?, decimals)?;
        let coverage = scale_amount(word_to_u128(word(&data, 2)?)?, decimals)?;
        let expiry_time = unix_time(word_to_i64(word(&data, 3)?)?)?;
        (
            LedgerEventKind::Purchase { premium, expiry_time },
            policy_ref,
            coverage,
        )
    } else if topic0 == PAYOUT_EXECUTED_TOPIC {
        let policy_ref = word_to_i64(word(&data, 0)?)?;
        let amount = scale_amount(word_to_u128(word(&data, 1)?)?, decimals)?;
        (LedgerEventKind::Settlement, policy_ref, amount)
    } else {
        return Err(LedgerError::Decode(format!("Unknown event topic {}", topic0)));
    };

    Ok(LedgerEvent {
        kind,
        holder,
        policy_ref: Some(policy_ref),
        amount,
        tx_ref: raw.transaction_hash.to_lowercase(),
        log_index,
        block_height,
        block_time,
    })
}

fn uint_word(value: u64) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 8..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Calldata for `executePayout(address user, uint256 policyId, string detectionRef)`
pub fn encode_execute_payout(
    holder: &str,
    policy_ref: i64,
    detection_ref: &str,
) -> Result<Vec<u8>, LedgerError> {
    let address = decode_hex(holder)?;
    if address.len() != 20 {
        return Err(LedgerError::Decode(format!("Invalid holder address {}", holder)));
    }
    let policy_ref = u64::try_from(policy_ref)
        .map_err(|_| LedgerError::Decode(format!("Negative policy id {}", policy_ref)))?;

    let text = detection_ref.as_bytes();
    let padded_len = text.len().div_ceil(WORD) * WORD;

    let mut out = Vec::with_capacity(4 + 4 * WORD + padded_len);
    out.extend_from_slice(&EXECUTE_PAYOUT_SELECTOR);

    let mut address_word = [0u8; WORD];
    address_word[WORD - 20..].copy_from_slice(&address);
    out.extend_from_slice(&address_word);
    out.extend_from_slice(&uint_word(policy_ref));
    // Head is three words, the string tail starts right after it
    out.extend_from_slice(&uint_word(3 * WORD as u64));
    out.extend_from_slice(&uint_word(text.len() as u64));
    out.extend_from_slice(text);
    out.resize(4 + 4 * WORD + padded_len, 0);

    Ok(out)
}
