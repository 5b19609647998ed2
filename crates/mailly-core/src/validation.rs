//! Field validation for batch items.
//!
//! Each field of a [`MessageRequest`] is checked against an ordered list of
//! [`Rule`]s. Validation stops at the first failing rule and reports a single
//! human-readable message. Some rules also normalize the value they inspect
//! (a blank display name is replaced with the default), which is why rules
//! take the value by `&mut`.
//!
//! Batch validation is all-or-nothing: the first invalid item aborts the whole
//! batch before any delivery work starts.

use crate::{Error, Result, types::MessageRequest};

/// A single validation rule applied to a named field.
///
/// Returns `Err(message)` when the value is rejected.
pub type Rule = fn(field: &str, value: &mut String, ctx: &Rules) -> core::result::Result<(), String>;

/// Tunables shared by the rule set.
#[derive(Debug, Clone)]
pub struct Rules {
    pub default_sender_name: String,
    pub max_recipient_len: usize,
    pub max_subject_len: usize,
    pub max_sender_name_len: usize,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            default_sender_name: crate::types::DEFAULT_SENDER_NAME.to_string(),
            max_recipient_len: 255,
            max_subject_len: 300,
            max_sender_name_len: 100,
        }
    }
}

pub fn required(field: &str, value: &mut String, _: &Rules) -> core::result::Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} is required"));
    }
    Ok(())
}

/// Accepts `local@domain.tld` where the TLD has at least two letters. Blank
/// values pass; combine with [`required`] to enforce presence.
pub fn email(field: &str, value: &mut String, _: &Rules) -> core::result::Result<(), String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || is_email_shaped(trimmed) {
        return Ok(());
    }
    Err(format!("{field} is not a valid email address"))
}

pub fn recipient_len(field: &str, value: &mut String, rules: &Rules) -> core::result::Result<(), String> {
    max_len(field, value, rules.max_recipient_len)
}

pub fn subject_len(field: &str, value: &mut String, rules: &Rules) -> core::result::Result<(), String> {
    max_len(field, value, rules.max_subject_len)
}

pub fn sender_name_len(
    field: &str,
    value: &mut String,
    rules: &Rules,
) -> core::result::Result<(), String> {
    max_len(field, value, rules.max_sender_name_len)
}

/// Replaces a blank display name with the configured default. Never fails.
pub fn default_sender_name(
    _: &str,
    value: &mut String,
    rules: &Rules,
) -> core::result::Result<(), String> {
    if value.trim().is_empty() {
        value.clone_from(&rules.default_sender_name);
    }
    Ok(())
}

fn max_len(field: &str, value: &str, max: usize) -> core::result::Result<(), String> {
    if value.chars().count() > max {
        return Err(format!(
            "{field} must be less than or equal to {max} characters"
        ));
    }
    Ok(())
}

fn is_email_shaped(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    if local.is_empty()
        || !local
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '%' | '+' | '-'))
    {
        return false;
    }
    let Some((host, tld)) = domain.rsplit_once('.') else {
        return false;
    };
    !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-'))
        && tld.len() >= 2
        && tld.chars().all(|c| c.is_ascii_alphabetic())
}

impl Rules {
    /// Validates a single request in place.
    ///
    /// # Errors
    ///
    /// Returns the message of the first failing rule.
    pub fn validate(&self, req: &mut MessageRequest) -> core::result::Result<(), String> {
        let fields: [(&str, &mut String, &[Rule]); 4] = [
            ("sent_to", &mut req.recipient, &[required, email, recipient_len]),
            ("subject", &mut req.subject, &[required, subject_len]),
            ("message", &mut req.body, &[required]),
            (
                "product_name",
                &mut req.sender_name,
                &[default_sender_name, sender_name_len],
            ),
        ];

        for (name, value, rules) in fields {
            for rule in rules {
                rule(name, value, self)?;
            }
        }
        Ok(())
    }

    /// Validates every item of a batch, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] naming the zero-based index of the
    /// first invalid item.
    pub fn validate_batch(&self, batch: &mut [MessageRequest]) -> Result<()> {
        for (idx, req) in batch.iter_mut().enumerate() {
            self.validate(req)
                .map_err(|msg| Error::invalid(format!("item {idx}: {msg}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(rule: Rule, input: &str) -> bool {
        let mut value = input.to_string();
        rule("field", &mut value, &Rules::default()).is_ok()
    }

    #[test]
    fn required_rule() {
        let cases = [
            ("", false),
            ("   ", false),
            ("hello", true),
            ("こんにちは", true),
        ];
        for (input, expected) in cases {
            assert_eq!(check(required, input), expected, "input {input:?}");
        }
    }

    #[test]
    fn email_rule() {
        let cases = [
            ("", true),
            ("a@x.com", true),
            ("first.last+tag@sub.example.org", true),
            ("bad-address", false),
            ("a@x", false),
            ("a@x.c", false),
            ("@x.com", false),
            ("a b@x.com", false),
            ("a@x.c0m", false),
        ];
        for (input, expected) in cases {
            assert_eq!(check(email, input), expected, "input {input:?}");
        }
    }

    #[test]
    fn max_length_counts_chars_not_bytes() {
        let rules = Rules {
            max_subject_len: 3,
            ..Rules::default()
        };
        let mut ok = "äöü".to_string();
        assert!(subject_len("subject", &mut ok, &rules).is_ok());
        let mut too_long = "äöüß".to_string();
        assert_eq!(
            subject_len("subject", &mut too_long, &rules).unwrap_err(),
            "subject must be less than or equal to 3 characters"
        );
    }

    #[test]
    fn blank_sender_name_is_defaulted() {
        let rules = Rules {
            default_sender_name: "Acme".to_string(),
            ..Rules::default()
        };
        let mut req = MessageRequest::new("a@x.com", "s", "m").with_sender_name("  ");
        rules.validate(&mut req).unwrap();
        assert_eq!(req.sender_name, "Acme");

        let mut named = MessageRequest::new("a@x.com", "s", "m").with_sender_name("Shop");
        rules.validate(&mut named).unwrap();
        assert_eq!(named.sender_name, "Shop");
    }

    #[test]
    fn first_failing_field_wins() {
        let mut req = MessageRequest::new("", "", "");
        assert_eq!(
            Rules::default().validate(&mut req).unwrap_err(),
            "sent_to is required"
        );
    }

    #[test]
    fn batch_reports_index_of_first_invalid_item() {
        let mut batch = vec![
            MessageRequest::new("a@x.com", "s", "m"),
            MessageRequest::new("b@x.com", "s", "m"),
            MessageRequest::new("bad-address", "s", "m"),
        ];
        let err = Rules::default().validate_batch(&mut batch).unwrap_err();
        assert_eq!(
            err,
            Error::invalid("item 2: sent_to is not a valid email address")
        );
    }
}
