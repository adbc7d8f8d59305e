//! The validation gate run against every inbound request message.
//!
//! Rules are expressed by implementing [`Validate`] for a message type. The
//! server runs it for unary requests directly before the handler is invoked
//! and for every message a streaming handler pulls from its
//! [`Streaming`](crate::Streaming). A failure terminates the call with
//! `InvalidArgument`; for streams the whole session is failed.

use std::fmt;

use thiserror::Error;

/// Outcome of validating one message.
pub type ValidationOutcome = Result<(), ValidationError>;

/// A message type that carries validation rules.
pub trait Validate {
    fn validate(&self) -> ValidationOutcome;
}

impl Validate for () {
    fn validate(&self) -> ValidationOutcome {
        Ok(())
    }
}

/// One broken rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path of the offending field, e.g. `packages[2].id`.
    pub field: String,
    /// Rule identifier, e.g. `int32.gt`.
    pub rule: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} [{}]", self.field, self.message, self.rule)
    }
}

/// All rules a message broke.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ValidationError {
    violations: Vec<Violation>,
}

impl ValidationError {
    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("validation error:")?;
        for violation in &self.violations {
            write!(f, "\n - {violation}")?;
        }
        Ok(())
    }
}

/// Collects violations while walking a message.
///
/// ```ignore
/// impl Validate for GetPackageInfoRequest {
///     fn validate(&self) -> ValidationOutcome {
///         Validator::new().int_gt("id", self.id.into(), 0).finish()
///     }
/// }
/// ```
#[derive(Debug, Default)]
pub struct Validator {
    prefix: String,
    violations: Vec<Violation>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    fn path(&self, field: &str) -> String {
        if self.prefix.is_empty() {
            field.to_owned()
        } else {
            format!("{}.{}", self.prefix, field)
        }
    }

    /// Record a violation unconditionally.
    pub fn violation(mut self, field: &str, rule: &str, message: impl Into<String>) -> Self {
        let field = self.path(field);
        self.violations.push(Violation {
            field,
            rule: rule.to_owned(),
            message: message.into(),
        });
        self
    }

    /// Record a violation unless `ok` holds.
    pub fn check(self, ok: bool, field: &str, rule: &str, message: impl Into<String>) -> Self {
        if ok {
            self
        } else {
            self.violation(field, rule, message)
        }
    }

    pub fn int_gt(self, field: &str, value: i64, bound: i64) -> Self {
        self.check(
            value > bound,
            field,
            "int.gt",
            format!("value must be greater than {bound}"),
        )
    }

    pub fn float_gte(self, field: &str, value: f64, bound: f64) -> Self {
        self.check(
            value.is_finite() && value >= bound,
            field,
            "float.gte",
            format!("value must be a finite number greater than or equal to {bound}"),
        )
    }

    pub fn min_len(self, field: &str, value: &str, min: usize) -> Self {
        self.check(
            value.chars().count() >= min,
            field,
            "string.min_len",
            format!("value length must be at least {min} characters"),
        )
    }

    pub fn max_len(self, field: &str, value: &str, max: usize) -> Self {
        self.check(
            value.chars().count() <= max,
            field,
            "string.max_len",
            format!("value length must be at most {max} characters"),
        )
    }

    /// Validate a nested message, prefixing its violations with `field`.
    pub fn nested<M: Validate>(mut self, field: &str, message: &M) -> Self {
        if let Err(err) = message.validate() {
            let prefix = self.path(field);
            self.violations
                .extend(err.violations.into_iter().map(|v| Violation {
                    field: format!("{prefix}.{}", v.field),
                    ..v
                }));
        }
        self
    }

    /// Validate every element of a repeated field.
    pub fn each<M: Validate>(mut self, field: &str, messages: &[M]) -> Self {
        for (index, message) in messages.iter().enumerate() {
            self = self.nested(&format!("{field}[{index}]"), message);
        }
        self
    }

    pub fn finish(self) -> ValidationOutcome {
        if self.violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationError {
                violations: self.violations,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Item {
        id: i32,
        name: String,
    }

    impl Validate for Item {
        fn validate(&self) -> ValidationOutcome {
            Validator::new()
                .int_gt("id", self.id.into(), 0)
                .max_len("name", &self.name, 4)
                .finish()
        }
    }

    struct Order {
        items: Vec<Item>,
    }

    impl Validate for Order {
        fn validate(&self) -> ValidationOutcome {
            Validator::new().each("items", &self.items).finish()
        }
    }

    #[test]
    fn test_valid_message() {
        let item = Item {
            id: 1,
            name: "ok".into(),
        };
        assert!(item.validate().is_ok());
    }

    #[test]
    fn test_collects_all_violations() {
        let item = Item {
            id: 0,
            name: "too long".into(),
        };
        let err = item.validate().unwrap_err();
        let fields: Vec<_> = err.violations().iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, ["id", "name"]);
        assert_eq!(err.violations()[0].rule, "int.gt");
    }

    #[test]
    fn test_nested_paths() {
        let order = Order {
            items: vec![
                Item {
                    id: 1,
                    name: "a".into(),
                },
                Item {
                    id: -4,
                    name: "b".into(),
                },
            ],
        };
        let err = order.validate().unwrap_err();
        assert_eq!(err.violations().len(), 1);
        assert_eq!(err.violations()[0].field, "items[1].id");
    }

    #[test]
    fn test_display() {
        let err = Validator::new()
            .violation("id", "int.gt", "value must be greater than 0")
            .finish()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error:\n - id: value must be greater than 0 [int.gt]"
        );
    }

    #[test]
    fn test_float_rejects_nan() {
        assert!(Validator::new().float_gte("w", f64::NAN, 0.0).finish().is_err());
        assert!(Validator::new().float_gte("w", 0.0, 0.0).finish().is_ok());
    }
}
