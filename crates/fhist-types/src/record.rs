//! History log record format.
//!
//! One record per line:
//!
//! ```text
//! {<hash>}\t<arrival>~<expires>~<date>\t<storage-token>\n
//! ```
//!
//! Timestamps are zero-padded 10-digit Unix seconds; `expires` may instead be
//! [`NEVER_EXPIRES`].

use std::time::{SystemTime, UNIX_EPOCH};

use fhist_error::{HistoryError, Result};

use crate::hash::{HashAlgo, validate_hash};

/// Expiry field value for records that never expire.
pub const NEVER_EXPIRES: &str = "----------";

const TIMESTAMP_DIGITS: usize = 10;
const MAX_TIMESTAMP: u64 = 9_999_999_999;

/// Expiry of a history record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expiry {
    Never,
    At(u64),
}

/// One immutable line of the history log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub hash: String,
    pub arrival: u64,
    pub expires: Expiry,
    pub date: u64,
    /// Opaque locator of the stored article.
    pub token: String,
}

impl HistoryRecord {
    /// Record arriving now, dated now, never expiring.
    #[must_use]
    pub fn new(hash: impl Into<String>, token: impl Into<String>) -> Self {
        let now = unix_now();
        Self {
            hash: hash.into(),
            arrival: now,
            expires: Expiry::Never,
            date: now,
            token: token.into(),
        }
    }

    /// Check the record can be written as one well-formed line.
    pub fn validate(&self, algo: HashAlgo) -> Result<()> {
        validate_hash(&self.hash, algo)?;
        for (field, value) in [("arrival", self.arrival), ("date", self.date)] {
            if value > MAX_TIMESTAMP {
                return Err(HistoryError::InvalidRecord {
                    detail: format!("{field} timestamp {value} exceeds 10 digits"),
                });
            }
        }
        if let Expiry::At(value) = self.expires {
            if value > MAX_TIMESTAMP {
                return Err(HistoryError::InvalidRecord {
                    detail: format!("expires timestamp {value} exceeds 10 digits"),
                });
            }
        }
        if self.token.bytes().any(|b| b == b'\t' || b == b'\n') {
            return Err(HistoryError::InvalidRecord {
                detail: "storage token contains a tab or newline".to_owned(),
            });
        }
        Ok(())
    }

    /// Render the record as a log line, including the trailing newline.
    #[must_use]
    pub fn format_line(&self) -> String {
        let expires = match self.expires {
            Expiry::Never => NEVER_EXPIRES.to_owned(),
            Expiry::At(ts) => format!("{ts:010}"),
        };
        format!(
            "{{{}}}\t{:010}~{}~{:010}\t{}\n",
            self.hash, self.arrival, expires, self.date, self.token
        )
    }

    /// Parse one log line (with or without its trailing newline).
    pub fn parse_line(line: &[u8]) -> Result<Self> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let text = std::str::from_utf8(line).map_err(|_| invalid("line is not utf-8"))?;

        let mut fields = text.splitn(3, '\t');
        let envelope = fields.next().unwrap_or_default();
        let times = fields.next().ok_or_else(|| invalid("missing timestamp field"))?;
        let token = fields.next().ok_or_else(|| invalid("missing storage token"))?;

        let hash = envelope
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
            .ok_or_else(|| invalid("hash envelope must be {...}"))?;
        if hash.is_empty() {
            return Err(invalid("empty hash"));
        }

        let mut parts = times.split('~');
        let (Some(arrival), Some(expires), Some(date), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid("timestamps must be arrival~expires~date"));
        };

        let expires = if expires == NEVER_EXPIRES {
            Expiry::Never
        } else {
            Expiry::At(parse_timestamp(expires, "expires")?)
        };

        Ok(Self {
            hash: hash.to_owned(),
            arrival: parse_timestamp(arrival, "arrival")?,
            expires,
            date: parse_timestamp(date, "date")?,
            token: token.to_owned(),
        })
    }
}

fn parse_timestamp(field: &str, what: &str) -> Result<u64> {
    if field.len() != TIMESTAMP_DIGITS || !field.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HistoryError::InvalidRecord {
            detail: format!("{what} must be {TIMESTAMP_DIGITS} digits, got {field:?}"),
        });
    }
    field.parse().map_err(|_| HistoryError::InvalidRecord {
        detail: format!("{what} is not a number: {field:?}"),
    })
}

fn invalid(detail: &str) -> HistoryError {
    HistoryError::InvalidRecord {
        detail: detail.to_owned(),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HistoryRecord {
        HistoryRecord {
            hash: HashAlgo::Sha256.digest(b"<a@b>"),
            arrival: 1_700_000_000,
            expires: Expiry::At(1_800_000_000),
            date: 1_699_999_999,
            token: "@0502ABCD@".to_owned(),
        }
    }

    #[test]
    fn line_layout() {
        let rec = sample();
        let line = rec.format_line();
        assert!(line.starts_with(&format!("{{{}}}\t", rec.hash)));
        assert!(line.contains("\t1700000000~1800000000~1699999999\t"));
        assert!(line.ends_with("@0502ABCD@\n"));
        assert_eq!(HistoryRecord::parse_line(line.as_bytes()).expect("parse"), rec);
    }

    #[test]
    fn never_expires_sentinel() {
        let mut rec = sample();
        rec.expires = Expiry::Never;
        let line = rec.format_line();
        assert!(line.contains("~----------~"), "{line}");
        let parsed = HistoryRecord::parse_line(line.as_bytes()).expect("parse");
        assert_eq!(parsed.expires, Expiry::Never);
    }

    #[test]
    fn rejects_broken_lines() {
        for bad in [
            "nobraces\t0000000001~----------~0000000001\tx\n",
            "{abc}\t1~2~3\tx\n",
            "{abc}\t0000000001~0000000002\tx\n",
            "{abc}\n",
        ] {
            assert!(HistoryRecord::parse_line(bad.as_bytes()).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn validate_catches_unwritable_records() {
        let mut rec = sample();
        rec.validate(HashAlgo::Sha256).expect("valid");
        rec.token = "tab\there".to_owned();
        assert!(rec.validate(HashAlgo::Sha256).is_err());
        let mut rec = sample();
        rec.arrival = 10_000_000_000;
        assert!(rec.validate(HashAlgo::Sha256).is_err());
    }
}
