//! Source-specific validation, pluggable the same way [`crate::sandbox::Sandbox`]
//! is: the embedder supplies an implementation, this crate only calls it at
//! the right points and turns a rejection into [`CoreError::ValidationFailed`].

use crate::error::Result;
use crate::path::DatasetPath;
use crate::value::StructuredValue;
use std::collections::BTreeMap;

pub trait Validator: Send + Sync {
    /// Called once per `create`, against the dataset's initial config.
    fn validate_config(&self, path: &DatasetPath, config: &BTreeMap<String, StructuredValue>) -> Result<()>;

    /// Called once per record in a `writeEntries` batch, before it commits.
    fn validate_record(&self, path: &DatasetPath, record_id: &str, value: &StructuredValue) -> Result<()>;
}

/// Accepts everything; the default when an embedder registers no validator.
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn validate_config(&self, _path: &DatasetPath, _config: &BTreeMap<String, StructuredValue>) -> Result<()> {
        Ok(())
    }

    fn validate_record(&self, _path: &DatasetPath, _record_id: &str, _value: &StructuredValue) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectEmptyStrings;
    impl Validator for RejectEmptyStrings {
        fn validate_config(&self, _path: &DatasetPath, _config: &BTreeMap<String, StructuredValue>) -> Result<()> {
            Ok(())
        }
        fn validate_record(&self, _path: &DatasetPath, record_id: &str, value: &StructuredValue) -> Result<()> {
            if matches!(value, StructuredValue::String(s) if s.is_empty()) {
                return Err(crate::error::CoreError::validation(format!("{record_id}: empty string")));
            }
            Ok(())
        }
    }

    #[test]
    fn noop_validator_accepts_anything() {
        let path = DatasetPath::new("src", "u", "n");
        assert!(NoopValidator.validate_config(&path, &BTreeMap::new()).is_ok());
        assert!(NoopValidator.validate_record(&path, "r1", &StructuredValue::Null).is_ok());
    }

    #[test]
    fn custom_validator_rejects_bad_records() {
        let path = DatasetPath::new("src", "u", "n");
        let v = RejectEmptyStrings;
        assert!(v.validate_record(&path, "r1", &StructuredValue::string("ok")).is_ok());
        assert!(v.validate_record(&path, "r1", &StructuredValue::string("")).is_err());
    }
}
