//! Form validation with field-scoped error lists.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use validator::ValidateEmail;

pub const MSG_REQUIRED: &str = "This field cannot be blank";
pub const MSG_INVALID_EMAIL: &str = "Invalid email address";

/// Errors keyed by field name, in insertion order per field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormErrors(BTreeMap<String, Vec<String>>);

impl FormErrors {
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_default().push(message.into());
    }

    /// First error for `field`, if any.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn all(&self, field: &str) -> &[String] {
        self.0.get(field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

impl std::fmt::Display for FormErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (field, messages) in &self.0 {
            for m in messages {
                if !first {
                    write!(f, "; ")?;
                }
                write!(f, "{field}: {m}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Submitted values plus the errors found so far.
#[derive(Debug, Default)]
pub struct Form {
    values: HashMap<String, String>,
    errors: FormErrors,
}

impl Form {
    pub fn new<'a>(values: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            values: values
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            errors: FormErrors::default(),
        }
    }

    pub fn get(&self, field: &str) -> &str {
        self.values.get(field).map(String::as_str).unwrap_or("")
    }

    /// True if the field was submitted with a non-blank value.
    pub fn has(&self, field: &str) -> bool {
        !self.get(field).trim().is_empty()
    }

    pub fn required(&mut self, fields: &[&str]) -> &mut Self {
        for field in fields {
            if !self.has(field) {
                self.errors.add(field, MSG_REQUIRED);
            }
        }
        self
    }

    pub fn min_length(&mut self, field: &str, length: usize) -> &mut Self {
        if self.get(field).chars().count() < length {
            self.errors
                .add(field, format!("This field must be at least {length} characters long"));
        }
        self
    }

    pub fn max_length(&mut self, field: &str, length: usize) -> &mut Self {
        if self.get(field).chars().count() > length {
            self.errors
                .add(field, format!("This field must be at most {length} characters long"));
        }
        self
    }

    pub fn is_email(&mut self, field: &str) -> &mut Self {
        if !self.get(field).trim().validate_email() {
            self.errors.add(field, MSG_INVALID_EMAIL);
        }
        self
    }

    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &FormErrors {
        &self.errors
    }

    pub fn into_errors(self) -> FormErrors {
        self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest_form(first: &str, last: &str, email: &str) -> Form {
        Form::new([("first_name", first), ("last_name", last), ("email", email)])
    }

    #[test]
    fn min_length() {
        let mut form = guest_form("Al", "Smith", "a@b.com");
        form.min_length("first_name", 3);
        assert!(!form.valid());
        assert_eq!(
            form.errors().get("first_name"),
            Some("This field must be at least 3 characters long")
        );

        let mut form = guest_form("Ally", "Smith", "a@b.com");
        form.min_length("first_name", 3);
        assert!(form.valid());
    }

    #[test]
    fn email() {
        let mut form = guest_form("Ally", "Smith", "not-an-email");
        form.is_email("email");
        assert_eq!(form.errors().get("email"), Some(MSG_INVALID_EMAIL));

        let mut form = guest_form("Ally", "Smith", "a@b.com");
        form.is_email("email");
        assert!(form.valid());
    }

    #[test]
    fn required() {
        let mut form = guest_form("Ally", "  ", "a@b.com");
        form.required(&["first_name", "last_name", "email"]);
        assert_eq!(form.errors().get("last_name"), Some(MSG_REQUIRED));
        assert_eq!(form.errors().fields().collect::<Vec<_>>(), vec!["last_name"]);

        let mut form = Form::new([("first_name", "Ally")]);
        form.required(&["first_name", "phone"]);
        assert_eq!(form.errors().get("phone"), Some(MSG_REQUIRED));
    }

    #[test]
    fn errors_accumulate_per_field() {
        let mut form = guest_form("", "Smith", "a@b.com");
        form.required(&["first_name"]).min_length("first_name", 3);
        assert_eq!(form.errors().all("first_name").len(), 2);
        assert_eq!(form.errors().get("first_name"), Some(MSG_REQUIRED));
    }

    #[test]
    fn max_length() {
        let long = "x".repeat(11);
        let mut form = Form::new([("phone", long.as_str())]);
        form.max_length("phone", 10);
        assert_eq!(
            form.errors().get("phone"),
            Some("This field must be at most 10 characters long")
        );
    }

    #[test]
    fn display_lists_every_error() {
        let mut form = guest_form("", "", "a@b.com");
        form.required(&["first_name", "last_name"]);
        let text = form.errors().to_string();
        assert!(text.contains("first_name: This field cannot be blank"));
        assert!(text.contains("last_name: This field cannot be blank"));
    }
}
