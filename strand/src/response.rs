use std::borrow::Cow;
use std::collections::BTreeMap;

use bytes::Bytes;
use strand_h2::HeaderField;

/// Header map keyed by lowercase name. Repeated fields are joined with `", "`.
pub type Headers = BTreeMap<String, String>;

/// A complete response: its headers (including `:status`) and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    headers: Headers,
    body: Bytes,
}

impl Response {
    pub(crate) fn new(headers: Headers, body: Bytes) -> Self {
        Self { headers, body }
    }

    /// Value of the `:status` pseudo-header.
    pub fn status(&self) -> Option<&str> {
        self.header(":status")
    }

    /// True for status `200`.
    pub fn is_ok(&self) -> bool {
        self.status() == Some("200")
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The body as UTF-8, with invalid sequences replaced.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

/// Merge decoded fields into `headers`.
pub(crate) fn merge(headers: &mut Headers, fields: Vec<HeaderField>) {
    for field in fields {
        let name = field.name_str().to_ascii_lowercase();
        let value = field.value_str().into_owned();
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_ok() {
        let mut headers = Headers::new();
        merge(&mut headers, vec![HeaderField::new(":status", "200")]);
        let response = Response::new(headers, Bytes::from_static(b"hi"));
        assert_eq!(response.status(), Some("200"));
        assert!(response.is_ok());
        assert_eq!(response.text(), "hi");

        let mut headers = Headers::new();
        merge(&mut headers, vec![HeaderField::new(":status", "204")]);
        assert!(!Response::new(headers, Bytes::new()).is_ok());
    }

    #[test]
    fn repeated_fields_are_joined() {
        let mut headers = Headers::new();
        merge(
            &mut headers,
            vec![
                HeaderField::new("Vary", "accept"),
                HeaderField::new("vary", "origin"),
            ],
        );
        assert_eq!(headers["vary"], "accept, origin");
    }
}
