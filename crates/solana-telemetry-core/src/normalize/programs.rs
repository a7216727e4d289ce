// Numan Thabit 2025
//! Well-known addresses used to derive tips and categories.

use serde::Serialize;

/// Fixed fee charged per transaction signature, in lamports.
pub const BASE_FEE_LAMPORTS_PER_SIGNATURE: u64 = 5_000;

/// Public Jito tip accounts.
pub const TIP_ACCOUNTS: [&str; 8] = [
    "96gYZGLnJYVFmbjzopPSU6QiEV5fGqZNyN9nmNhvrZU5",
    "HFqU5x63VTqvQss8hp11i4wVV8bD44PvwucfZ2bU7gRe",
    "Cw8CFyM9FkoMi7K7Crf6HNQqf4uEMzpKw6QNghXLvLkY",
    "ADaUMid9yfUytqMBgopwjb2DTLSokTSzL1zt6iGPaS49",
    "DfXygSm4jCyNCybVYYK6DwvWqjKee8pbDmJGcLWNDXjh",
    "ADuUkR4vqLUMWXxW9gh6D6L8pMSawimctcNZ5pGwDcEt",
    "DttWaMuVvTiduZRnguLF7jNxTgiMBZ1hyAumKUiL2KRL",
    "3AVi9Tg9Uo68tJfuvoKvqKNWKkC5wPdSSdeBnizKZ6jT",
];

const VOTE_PROGRAM: &str = "Vote111111111111111111111111111111111111111";
const SYSTEM_PROGRAM: &str = "11111111111111111111111111111111";

const TOKEN_PROGRAMS: [&str; 3] = [
    "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
    "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb",
    "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL",
];

const DEX_PROGRAMS: [&str; 8] = [
    "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4",
    "whirLbMiicVdio4qvUfM5KAg6Ct8VwpYzGff3uctyCc",
    "675kPX9MHTjS2zt1qfr1NYHuzeLXfQM9H24wFSUt1Mp8",
    "CAMMCzo5YL8w4VFF8KVHrK22GGUsp5VTaW7grrKgrWqK",
    "LBUZKhRxPF3XUpBCjp4YzTKgLccjZhTSDM9YuVaPwxo",
    "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P",
    "pAMMBay6oceH9fJKBRHGP5D4bD4sWpmSwMn52FMfXEA",
    "PhoeNiXZ8ByJGLkxNfZRnkUfjvmuYqLR89jjFHGqdXY",
];

/// Returns true for one of the fixed tip accounts.
pub fn is_tip_account(key: &str) -> bool {
    TIP_ACCOUNTS.contains(&key)
}

/// Coarse bucket a transaction is counted under in historical aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxCategory {
    /// Consensus vote.
    Vote,
    /// Touches a known swap/AMM/orderbook program.
    Dex,
    /// Token or associated-token program activity.
    Token,
    /// Only system program (plus compute budget) instructions.
    System,
    /// Anything else.
    Other,
}

impl TxCategory {
    /// Stable storage label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vote => "vote",
            Self::Dex => "dex",
            Self::Token => "token",
            Self::System => "system",
            Self::Other => "other",
        }
    }

    /// Pick the most specific category for an invoked program set.
    pub fn classify<S: AsRef<str>>(programs: &[S]) -> Self {
        let has = |set: &[&str]| programs.iter().any(|p| set.contains(&p.as_ref()));
        if has(&[VOTE_PROGRAM]) {
            Self::Vote
        } else if has(&DEX_PROGRAMS) {
            Self::Dex
        } else if has(&TOKEN_PROGRAMS) {
            Self::Token
        } else if has(&[SYSTEM_PROGRAM]) {
            Self::System
        } else {
            Self::Other
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tip_accounts_are_valid_base58_keys() {
        for key in TIP_ACCOUNTS {
            let bytes = bs58::decode(key).into_vec().expect("base58 tip account");
            assert_eq!(bytes.len(), 32, "{key}");
        }
    }

    #[test]
    fn classification_prefers_most_specific_category() {
        assert_eq!(TxCategory::classify(&[VOTE_PROGRAM]), TxCategory::Vote);
        assert_eq!(
            TxCategory::classify(&[SYSTEM_PROGRAM, TOKEN_PROGRAMS[0], DEX_PROGRAMS[0]]),
            TxCategory::Dex
        );
        assert_eq!(
            TxCategory::classify(&[SYSTEM_PROGRAM, TOKEN_PROGRAMS[2]]),
            TxCategory::Token
        );
        assert_eq!(TxCategory::classify(&[SYSTEM_PROGRAM]), TxCategory::System);
        assert_eq!(TxCategory::classify::<&str>(&[]), TxCategory::Other);
    }
}
