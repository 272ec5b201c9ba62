use serde::Serialize;
use std::fmt;
use validator::{Validate, ValidationErrors};

/// A single field that failed validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub description: String,
}

/// All violations found on one struct, plus a human readable summary.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructViolation {
    pub description: String,
    pub violations: Vec<FieldViolation>,
}

impl StructViolation {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            violations: Vec::new(),
        }
    }

    pub fn add_violation(&mut self, field: impl Into<String>, description: impl Into<String>) {
        self.violations.push(FieldViolation {
            field: field.into(),
            description: description.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.violations.is_empty()
    }

    /// Builds a violation from `validator` output. `entity` prefixes the
    /// namespace in descriptions, e.g. `Visit.FirstName`.
    pub fn from_errors(entity: &str, errors: &ValidationErrors) -> Self {
        let mut fields: Vec<_> = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| (wire_name(field.as_ref()), errs))
            .collect();
        fields.sort_by(|a, b| a.0.cmp(&b.0));

        let mut violation = StructViolation::default();
        let mut summary = Vec::new();

        for (field, errs) in fields {
            for err in errs.iter() {
                let description = format!(
                    "Key: '{}.{}' Error:Field validation for '{}' failed on the '{}' tag",
                    entity, field, field, err.code
                );
                summary.push(description.clone());
                violation.add_violation(field.clone(), description);
            }
        }

        violation.description = summary.join("\n");
        violation
    }
}

impl fmt::Display for StructViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl std::error::Error for StructViolation {}

/// Runs derive-based validation and converts failures to a `StructViolation`.
pub fn validate_struct<T: Validate>(entity: &str, value: &T) -> Result<(), StructViolation> {
    value
        .validate()
        .map_err(|errors| StructViolation::from_errors(entity, &errors))
}

/// `first_name` -> `FirstName`, the casing used on the wire.
pub fn wire_name(field: &str) -> String {
    field
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Validate)]
    struct Person {
        #[validate(length(min = 2))]
        first_name: String,
        #[validate(length(min = 2, max = 4))]
        last_name: String,
    }

    #[test]
    fn test_wire_name() {
        assert_eq!(wire_name("first_name"), "FirstName");
        assert_eq!(wire_name("id"), "Id");
        assert_eq!(wire_name("already"), "Already");
    }

    #[test]
    fn test_valid_struct_passes() {
        let person = Person {
            first_name: "Ada".to_string(),
            last_name: "Love".to_string(),
        };
        assert!(validate_struct("Person", &person).is_ok());
    }

    #[test]
    fn test_violations_are_sorted_and_described() {
        let person = Person {
            first_name: "A".to_string(),
            last_name: "Lovelace".to_string(),
        };

        let violation = validate_struct("Person", &person).unwrap_err();
        assert_eq!(violation.violations.len(), 2);
        assert_eq!(violation.violations[0].field, "FirstName");
        assert_eq!(violation.violations[1].field, "LastName");
        assert_eq!(
            violation.violations[0].description,
            "Key: 'Person.FirstName' Error:Field validation for 'FirstName' failed on the 'length' tag"
        );
        assert!(violation.to_string().contains("Person.LastName"));
    }
}
