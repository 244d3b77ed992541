use crate::errors::{ValidationError, DomainResult, DomainError};
use regex::Regex;
use std::sync::OnceLock;

/// A trait that DTOs implement for validation.
pub trait Validate {
    /// Validates the value and returns an error if validation fails.
    fn validate(&self) -> DomainResult<()>;
}

// Table, column and entity tags end up in SQL text, so they are held to a
// plain identifier shape.
fn identifier_regex() -> &'static Regex {
    static IDENTIFIER_REGEX: OnceLock<Regex> = OnceLock::new();
    IDENTIFIER_REGEX.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").unwrap())
}

/// Struct for configuring validations in a fluent style
#[derive(Default)]
pub struct ValidationBuilder<T> {
    field_name: String,
    value: Option<T>,
    errors: Vec<ValidationError>,
}

/// Generic validation implementations
impl<T> ValidationBuilder<T> {
    pub fn new(field_name: &str, value: Option<T>) -> Self {
        Self {
            field_name: field_name.to_string(),
            value,
            errors: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self
    where T: Default + PartialEq {
        if self.value.is_none() || self.value == Some(T::default()) {
            self.errors.push(ValidationError::required(&self.field_name));
        }
        self
    }

    pub fn validate_with<F>(mut self, validator: F) -> Self
    where F: FnOnce(&T) -> Result<(), ValidationError> {
        if let Some(value) = &self.value {
            if let Err(err) = validator(value) {
                self.errors.push(err);
            }
        }
        self
    }

    /// Complete validation and return result
    pub fn validate(self) -> DomainResult<()> {
        match self.errors.into_iter().next() {
            None => Ok(()),
            // Return the first error for simplicity
            Some(err) => Err(DomainError::Validation(err)),
        }
    }
}

/// String-specific validations
impl ValidationBuilder<String> {
    pub fn not_blank(mut self) -> Self {
        if let Some(value) = &self.value {
            if value.trim().is_empty() {
                self.errors.push(ValidationError::required(&self.field_name));
            }
        }
        self
    }

    pub fn max_length(mut self, max: usize) -> Self {
        if let Some(value) = &self.value {
            if value.len() > max {
                self.errors.push(ValidationError::max_length(&self.field_name, max));
            }
        }
        self
    }

    pub fn identifier(mut self) -> Self {
        if let Some(value) = &self.value {
            if !identifier_regex().is_match(value) {
                self.errors.push(ValidationError::format(
                    &self.field_name,
                    "must start with a letter or underscore and contain only letters, digits and underscores",
                ));
            }
        }
        self
    }
}

/// Numeric validations
impl ValidationBuilder<u64> {
    pub fn max(mut self, max: u64) -> Self {
        if let Some(value) = self.value {
            if value > max {
                self.errors.push(ValidationError::range(&self.field_name, 1, max));
            }
        }
        self
    }
}

/// True when `value` is usable as a SQL identifier or entity tag.
pub fn is_identifier(value: &str) -> bool {
    identifier_regex().is_match(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_validation() {
        assert!(is_identifier("notes"));
        assert!(is_identifier("Expense_Receipt2"));
        assert!(is_identifier("_private"));
        assert!(!is_identifier("2fast"));
        assert!(!is_identifier("notes; DROP TABLE documents"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("with-dash"));
    }

    #[test]
    fn test_validation_builder() {
        let result = ValidationBuilder::new("entity_name", Some("".to_string()))
            .required()
            .validate();
        assert!(matches!(result, Err(DomainError::Validation(ValidationError::Required { .. }))));

        let result = ValidationBuilder::new("field", Some("   ".to_string()))
            .not_blank()
            .validate();
        assert!(result.is_err());

        let result = ValidationBuilder::new("field", Some("cover image".to_string()))
            .identifier()
            .validate();
        assert!(matches!(result, Err(DomainError::Validation(ValidationError::Format { .. }))));

        let result = ValidationBuilder::new("size", Some(11u64)).max(10).validate();
        assert!(result.is_err());

        let value: Option<String> = None;
        let result = ValidationBuilder::new("field", value).required().validate();
        assert!(result.is_err());

        let result = ValidationBuilder::new("field", Some("attachments".to_string()))
            .required()
            .identifier()
            .max_length(64)
            .validate();
        assert!(result.is_ok());
    }
}
