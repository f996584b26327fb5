//! Content-addressed row keys
//!
//! Every aggregate row is located by a digest of its natural key, so the
//! existence check and the increment both hit the primary key. The input
//! layout (`!`-joined fields, ISO dates) must never change: rows written by
//! an older build would stop matching and get double counted.

use chrono::NaiveDate;
use sha2::{Digest, Sha256};

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"!");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Key of a `daily_counts` row: (day, idp, sp)
pub fn daily_key(day: NaiveDate, idp_entity_id: &str, sp_entity_id: &str) -> String {
    let day = day.format("%Y-%m-%d").to_string();
    digest(&[&day, idp_entity_id, sp_entity_id])
}

/// Key of a `last_login` row: (user, sp)
pub fn last_login_key(user_id: &str, sp_entity_id: &str) -> String {
    digest(&[user_id, sp_entity_id])
}

/// Key of a `unique_logins` row: (month, user, sp, idp)
pub fn unique_login_key(month: NaiveDate, user_id: &str, sp_entity_id: &str, idp_entity_id: &str) -> String {
    let month = month.format("%Y-%m").to_string();
    digest(&[&month, user_id, sp_entity_id, idp_entity_id])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn daily_key_is_deterministic() {
        let a = daily_key(day(2012, 4, 21), "idp2", "sp1");
        let b = daily_key(day(2012, 4, 21), "idp2", "sp1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn daily_key_matches_sha256_of_joined_fields() {
        let expected = hex::encode(Sha256::digest(b"2012-04-21!idp2!sp1"));
        assert_eq!(daily_key(day(2012, 4, 21), "idp2", "sp1"), expected);
    }

    #[test]
    fn daily_key_separates_each_component() {
        let base = daily_key(day(2012, 4, 21), "idp", "sp");
        assert_ne!(base, daily_key(day(2012, 4, 22), "idp", "sp"));
        assert_ne!(base, daily_key(day(2012, 4, 21), "idp-x", "sp"));
        assert_ne!(base, daily_key(day(2012, 4, 21), "idp", "sp-x"));
        // idp and sp are not interchangeable
        assert_ne!(daily_key(day(2012, 4, 21), "a", "b"), daily_key(day(2012, 4, 21), "b", "a"));
    }

    #[test]
    fn last_login_key_ignores_time() {
        assert_eq!(last_login_key("user_1", "sp1"), last_login_key("user_1", "sp1"));
        assert_ne!(last_login_key("user_1", "sp1"), last_login_key("user_1", "sp2"));
        assert_ne!(last_login_key("user_1", "sp1"), last_login_key("user_2", "sp1"));
    }

    #[test]
    fn unique_login_key_buckets_by_month() {
        let early = unique_login_key(day(2013, 1, 2), "u", "sp", "idp");
        let late = unique_login_key(day(2013, 1, 30), "u", "sp", "idp");
        let next = unique_login_key(day(2013, 2, 1), "u", "sp", "idp");
        assert_eq!(early, late);
        assert_ne!(early, next);
    }
}
