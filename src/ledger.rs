//! Expense ledger
//!
//! Users append spending and savings entries. Savings deposits are ledger
//! entries in the `savings` category; every other category counts as spending.
//! Appending an entry is what drives challenge settlement and achievement
//! checks, so [`register_expense`] runs both right after the insert.

use crate::achievement::{self, UnlockedAchievement};
use crate::challenge::{self, Settlement};
use crate::db::{Database, DbError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseCategory {
    Food,
    Education,
    Clothing,
    Other,
    Savings,
}

impl ExpenseCategory {
    pub const ALL: [ExpenseCategory; 5] = [
        ExpenseCategory::Food,
        ExpenseCategory::Education,
        ExpenseCategory::Clothing,
        ExpenseCategory::Other,
        ExpenseCategory::Savings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExpenseCategory::Food => "food",
            ExpenseCategory::Education => "education",
            ExpenseCategory::Clothing => "clothing",
            ExpenseCategory::Other => "other",
            ExpenseCategory::Savings => "savings",
        }
    }
}

impl fmt::Display for ExpenseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpenseCategory {
    type Err = DbError;

    /// Case-insensitive
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        ExpenseCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| {
                DbError::Validation(format!(
                    "unknown category '{}' (expected one of: food, education, clothing, other, savings)",
                    s
                ))
            })
    }
}

/// Which ledger entries a sum covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CategoryFilter {
    Only(ExpenseCategory),
    Except(ExpenseCategory),
}

impl CategoryFilter {
    /// Savings deposits only
    pub fn savings() -> Self {
        CategoryFilter::Only(ExpenseCategory::Savings)
    }

    /// Everything that is not a savings deposit
    pub fn spending() -> Self {
        CategoryFilter::Except(ExpenseCategory::Savings)
    }
}

/// A ledger entry to append
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub user_id: i32,
    pub amount: f64,
    pub category: ExpenseCategory,
    pub store_name: String,
    pub spent_at: DateTime<Utc>,
}

/// What appending an entry set in motion
#[derive(Debug, Clone, Serialize)]
pub struct ExpenseOutcome {
    pub expense_id: i32,
    pub settled: Vec<Settlement>,
    pub unlocked: Vec<UnlockedAchievement>,
}

/// Append an entry, then settle challenges and check achievements as of now
pub fn register_expense(db: &Database, entry: &NewEntry) -> Result<ExpenseOutcome> {
    register_expense_at(db, entry, Utc::now())
}

/// Same as [`register_expense`] with an explicit evaluation time
pub fn register_expense_at(db: &Database, entry: &NewEntry, now: DateTime<Utc>) -> Result<ExpenseOutcome> {
    if !entry.amount.is_finite() || entry.amount <= 0.0 {
        return Err(DbError::Validation(format!(
            "amount must be a positive number, got {}",
            entry.amount
        )));
    }
    db.require_user(entry.user_id)?;

    let expense_id = db.insert_expense(
        entry.user_id,
        entry.amount,
        entry.category.as_str(),
        entry.store_name.trim(),
        entry.spent_at,
    )?;
    db.mark_active_day(entry.user_id, entry.spent_at)?;
    info!(
        user_id = entry.user_id,
        expense_id,
        amount = entry.amount,
        category = %entry.category,
        "expense registered"
    );

    let settled = challenge::advance_challenge_states_at(db, entry.user_id, now)?;
    let unlocked = achievement::unlock_for_user(db, entry.user_id, now)?;

    Ok(ExpenseOutcome {
        expense_id,
        settled,
        unlocked,
    })
}

/// Savings deposits summed per calendar month (`YYYY-MM`), ascending
pub fn monthly_savings(db: &Database, user_id: i32) -> Result<Vec<(String, f64)>> {
    let rows = db.expenses_in_category(user_id, ExpenseCategory::Savings.as_str())?;
    let mut months: Vec<(String, f64)> = Vec::new();
    for row in rows {
        let month: String = row.spent_at.chars().take(7).collect();
        match months.last_mut() {
            Some((last, total)) if *last == month => *total += row.amount,
            _ => months.push((month, row.amount)),
        }
    }
    Ok(months)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_category_parse_is_case_insensitive() {
        assert_eq!("Savings".parse::<ExpenseCategory>().unwrap(), ExpenseCategory::Savings);
        assert_eq!(" food ".parse::<ExpenseCategory>().unwrap(), ExpenseCategory::Food);
        assert!("rent".parse::<ExpenseCategory>().is_err());
    }

    #[test]
    fn test_filters() {
        assert_eq!(CategoryFilter::savings(), CategoryFilter::Only(ExpenseCategory::Savings));
        assert_eq!(CategoryFilter::spending(), CategoryFilter::Except(ExpenseCategory::Savings));
    }

    #[test]
    fn test_register_rejects_non_positive_amounts() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path().join("ledger.db")).unwrap();
        let user = db.create_user("ana@example.com", "Ana").unwrap();

        for amount in [0.0, -5.0, f64::NAN] {
            let entry = NewEntry {
                user_id: user,
                amount,
                category: ExpenseCategory::Food,
                store_name: "market".into(),
                spent_at: Utc::now(),
            };
            assert!(matches!(register_expense(&db, &entry), Err(DbError::Validation(_))));
        }
        assert!(db.list_expenses(user, 10).unwrap().is_empty());
    }

    #[test]
    fn test_monthly_savings_groups_by_month() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path().join("ledger.db")).unwrap();
        let user = db.create_user("ana@example.com", "Ana").unwrap();
        let jan = Utc.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let feb = Utc.with_ymd_and_hms(2026, 2, 3, 12, 0, 0).unwrap();

        db.insert_expense(user, 100.0, "savings", "bank", jan).unwrap();
        db.insert_expense(user, 50.0, "savings", "bank", jan).unwrap();
        db.insert_expense(user, 999.0, "food", "market", jan).unwrap();
        db.insert_expense(user, 70.0, "savings", "bank", feb).unwrap();

        let months = monthly_savings(&db, user).unwrap();
        assert_eq!(months, vec![("2026-01".to_string(), 150.0), ("2026-02".to_string(), 70.0)]);
    }
}
