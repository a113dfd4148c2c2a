//! Immutable project ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Direction of a ledger entry from the project's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Money in.
    Credit,
    /// Money out.
    Debit,
}

impl EntryType {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credit => "credit",
            Self::Debit => "debit",
        }
    }

    pub fn from_string(value: &str) -> Option<Self> {
        match value {
            "credit" => Some(Self::Credit),
            "debit" => Some(Self::Debit),
            _ => None,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Credit => Self::Debit,
            Self::Debit => Self::Credit,
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Source document an entry was posted for. Together with the source id this
/// is the idempotency key of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTable {
    CustomerPayments,
    VendorPayments,
    /// Reversal of an earlier entry; the source id is that entry's id.
    ProjectLedger,
}

impl SourceTable {
    /// Get string representation for database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CustomerPayments => "customer_payments",
            Self::VendorPayments => "vendor_payments",
            Self::ProjectLedger => "project_ledger",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub project_id: Uuid,
    pub source_table: String,
    pub source_id: Uuid,
    pub entry_type: String,
    pub amount: Decimal,
    pub remarks: Option<String>,
    pub posted_by: Option<Uuid>,
    pub entry_utc: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn parsed_entry_type(&self) -> Option<EntryType> {
        EntryType::from_string(&self.entry_type)
    }

    /// Get signed amount (positive for credit, negative for debit).
    pub fn signed_amount(&self) -> Decimal {
        match self.parsed_entry_type() {
            Some(EntryType::Credit) => self.amount,
            Some(EntryType::Debit) => -self.amount,
            None => Decimal::ZERO,
        }
    }
}

/// Ledger line with running balance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerLine {
    pub entry: LedgerEntry,
    pub running_balance: Decimal,
}

/// Project ledger in posting order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectLedger {
    pub project_id: Uuid,
    pub total_credit: Decimal,
    pub total_debit: Decimal,
    pub balance: Decimal,
    pub lines: Vec<LedgerLine>,
}

impl ProjectLedger {
    /// Fold entries (already in posting order) into running-balance lines.
    pub fn from_entries(project_id: Uuid, entries: Vec<LedgerEntry>) -> Self {
        let mut total_credit = Decimal::ZERO;
        let mut total_debit = Decimal::ZERO;
        let mut balance = Decimal::ZERO;
        let mut lines = Vec::with_capacity(entries.len());

        for entry in entries {
            match entry.parsed_entry_type() {
                Some(EntryType::Credit) => total_credit += entry.amount,
                Some(EntryType::Debit) => total_debit += entry.amount,
                None => {}
            }
            balance += entry.signed_amount();
            lines.push(LedgerLine {
                entry,
                running_balance: balance,
            });
        }

        Self {
            project_id,
            total_credit,
            total_debit,
            balance,
            lines,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(entry_type: EntryType, amount: Decimal) -> LedgerEntry {
        LedgerEntry {
            entry_id: Uuid::new_v4(),
            project_id: Uuid::nil(),
            source_table: SourceTable::CustomerPayments.as_str().to_string(),
            source_id: Uuid::new_v4(),
            entry_type: entry_type.as_str().to_string(),
            amount,
            remarks: None,
            posted_by: None,
            entry_utc: Utc::now(),
        }
    }

    #[test]
    fn test_running_balance() {
        let ledger = ProjectLedger::from_entries(
            Uuid::nil(),
            vec![
                entry(EntryType::Credit, dec!(100000)),
                entry(EntryType::Debit, dec!(30000)),
                entry(EntryType::Credit, dec!(5000)),
            ],
        );

        let balances: Vec<_> = ledger.lines.iter().map(|l| l.running_balance).collect();
        assert_eq!(balances, vec![dec!(100000), dec!(70000), dec!(75000)]);
        assert_eq!(ledger.total_credit, dec!(105000));
        assert_eq!(ledger.total_debit, dec!(30000));
        assert_eq!(ledger.balance, dec!(75000));
    }

    #[test]
    fn test_opposite_entry_type() {
        assert_eq!(EntryType::Credit.opposite(), EntryType::Debit);
        assert_eq!(EntryType::Debit.opposite(), EntryType::Credit);
    }
}
