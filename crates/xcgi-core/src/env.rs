//! Process environment for a script invocation.
//!
//! Request metadata becomes flat `NAME=value` pairs layered over the host's
//! own environment: `REQUEST_*`, `HTTP_*` headers, `QUERY_*` fields and path
//! ids, `_POST_*` body fields, `_FILES_*` upload paths and the `STATUS_*`
//! exit-code vocabulary.

use std::collections::BTreeMap;
use std::path::Path;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::rest::PathObject;

/// Final variable map handed to the process.
pub type Environment = BTreeMap<String, String>;

/// Ordered multi-valued fields, as parsed from a query string or form body.
pub type Fields = Vec<(String, Vec<String>)>;

/// Suffix marking a field whose values should all be passed on.
pub const ARRAY_MARKER: &str = "[]";

/// Separator between values of a marked field.
pub const ARRAY_SEPARATOR: &str = " ";

/// Exit-code names scripts use to pick their HTTP status.
pub const STATUS_VOCABULARY: [(&str, u8); 9] = [
    ("STATUS_OK", 0),
    ("STATUS_BADREQUEST", 1),
    ("STATUS_NOTFOUND", 2),
    ("STATUS_CREATED", 3),
    ("STATUS_NOCONTENT", 4),
    ("STATUS_NOTMODIFIED", 5),
    ("STATUS_FORBIDDEN", 6),
    ("STATUS_CONFLICT", 7),
    ("STATUS_UNAUTHORIZED", 8),
];

/// Characters left alone by JavaScript's `encodeURI`.
const ENCODE_URI: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b';')
    .remove(b',')
    .remove(b'/')
    .remove(b'?')
    .remove(b':')
    .remove(b'@')
    .remove(b'&')
    .remove(b'=')
    .remove(b'+')
    .remove(b'$')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'#');

/// Request metadata the environment is built from.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    /// Request path without the query string.
    pub url: &'a str,
    pub method: &'a str,
    /// `1.0`, `1.1`, `2.0`, ...
    pub http_version: &'a str,
    pub headers: &'a [(String, String)],
    pub query: &'a Fields,
    pub objects: &'a [PathObject],
    pub document_root: &'a Path,
}

/// Builder for a script's environment.
#[derive(Debug, Clone, Default)]
pub struct EnvBuilder {
    vars: Environment,
}

impl EnvBuilder {
    /// Start from a base environment, usually the host process's own.
    pub fn new(base: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut builder = Self::default();
        for (name, value) in base {
            builder.set(name, value);
        }
        builder
    }

    /// Add the request-derived variables.
    pub fn request(mut self, meta: &RequestMeta<'_>) -> Self {
        self.set("REQUEST_URL", meta.url);
        for (key, values) in meta.query {
            self.field("QUERY_", key, values);
        }

        self.set("REQUEST_METHOD", meta.method);
        self.set("HTTP_VERSION", meta.http_version);
        for (name, value) in meta.headers {
            self.set(format!("HTTP_{}", name.replace('-', "_").to_uppercase()), value);
        }

        self.set("DOCUMENT_ROOT", meta.document_root.to_string_lossy());

        for object in meta.objects {
            let id = object.id.as_deref().unwrap_or_default();
            self.set(format!("QUERY_{}_ID", object.resource.to_uppercase()), id);
        }
        if let Some(last) = meta.objects.last() {
            self.set("QUERY_ID", last.id.as_deref().unwrap_or_default());
        }

        for (name, code) in STATUS_VOCABULARY {
            self.set(name, code.to_string());
        }
        self
    }

    /// Add parsed body fields as `_POST_<FIELD>`.
    pub fn post_fields(&mut self, fields: &Fields) {
        for (name, values) in fields {
            self.field("_POST_", name, values);
        }
    }

    /// Add uploaded file paths as `_FILES_<FIELD>`.
    pub fn files(&mut self, fields: &Fields) {
        for (name, paths) in fields {
            self.field("_FILES_", name, paths);
        }
    }

    /// Set one multi-valued field under `prefix`.
    ///
    /// A name ending in `[]` keeps every value, URI-encoded and space
    /// separated; otherwise only the first value is used. No values, no
    /// variable.
    pub fn field(&mut self, prefix: &str, name: &str, values: &[String]) {
        if values.is_empty() {
            return;
        }
        let name = name.to_uppercase();
        match name.strip_suffix(ARRAY_MARKER).filter(|base| !base.is_empty()) {
            Some(base) => {
                let joined = values
                    .iter()
                    .map(|v| utf8_percent_encode(v, ENCODE_URI).to_string())
                    .collect::<Vec<_>>()
                    .join(ARRAY_SEPARATOR);
                self.set(format!("{prefix}{base}"), joined);
            }
            None => self.set(format!("{prefix}{name}"), &values[0]),
        }
    }

    /// Set a variable. Names or values the OS cannot carry are skipped.
    pub fn set(&mut self, name: impl Into<String>, value: impl AsRef<str>) {
        let name = name.into();
        let value = value.as_ref();
        if name.is_empty() || name.contains(['=', '\0']) || value.contains('\0') {
            tracing::debug!(%name, "skipping unrepresentable environment variable");
            return;
        }
        self.vars.insert(name, value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn build(self) -> Environment {
        self.vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rest::decompose;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn build(method: &str, url: &str, query: &Fields, relative: &str) -> Environment {
        let headers = vec![
            ("host".to_string(), "shop.example.com".to_string()),
            ("x-request-id".to_string(), "abc".to_string()),
        ];
        let objects = decompose(relative);
        let meta = RequestMeta {
            url,
            method,
            http_version: "1.1",
            headers: &headers,
            query,
            objects: &objects,
            document_root: Path::new("/srv/sites/shop"),
        };
        EnvBuilder::new([("PATH".to_string(), "/usr/bin".to_string())])
            .request(&meta)
            .build()
    }

    #[test]
    fn test_request_variables() {
        let env = build("GET", "/orders/42", &Vec::new(), "/orders/42");
        assert_eq!(env["REQUEST_URL"], "/orders/42");
        assert_eq!(env["REQUEST_METHOD"], "GET");
        assert_eq!(env["HTTP_VERSION"], "1.1");
        assert_eq!(env["DOCUMENT_ROOT"], "/srv/sites/shop");
        assert_eq!(env["HTTP_HOST"], "shop.example.com");
        assert_eq!(env["HTTP_X_REQUEST_ID"], "abc");
        assert_eq!(env["QUERY_ORDERS_ID"], "42");
        assert_eq!(env["QUERY_ID"], "42");
        assert_eq!(env["PATH"], "/usr/bin");
    }

    #[test]
    fn test_status_vocabulary() {
        let env = build("GET", "/", &Vec::new(), "/");
        assert_eq!(env["STATUS_OK"], "0");
        assert_eq!(env["STATUS_BADREQUEST"], "1");
        assert_eq!(env["STATUS_NOTFOUND"], "2");
        assert_eq!(env["STATUS_CREATED"], "3");
        assert_eq!(env["STATUS_NOCONTENT"], "4");
        assert_eq!(env["STATUS_NOTMODIFIED"], "5");
        assert_eq!(env["STATUS_FORBIDDEN"], "6");
        assert_eq!(env["STATUS_CONFLICT"], "7");
        assert_eq!(env["STATUS_UNAUTHORIZED"], "8");
        assert!(!env.contains_key("QUERY_ID"));
    }

    #[test]
    fn test_nested_ids_and_trailing_collection() {
        let env = build("GET", "/users/7/posts", &Vec::new(), "/users/7/posts");
        assert_eq!(env["QUERY_USERS_ID"], "7");
        assert_eq!(env["QUERY_POSTS_ID"], "");
        assert_eq!(env["QUERY_ID"], "");
    }

    #[test]
    fn test_query_fields() {
        let query: Fields = vec![
            ("page".to_string(), strings(&["2", "3"])),
            ("tags[]".to_string(), strings(&["a b", "c/d", "é"])),
            ("one[]".to_string(), strings(&["x y"])),
            ("id".to_string(), strings(&["99"])),
        ];
        let env = build("GET", "/orders/42", &query, "/orders/42");
        assert_eq!(env["QUERY_PAGE"], "2");
        assert_eq!(env["QUERY_TAGS"], "a%20b c/d %C3%A9");
        assert_eq!(env["QUERY_ONE"], "x%20y");
        // Path ids take precedence over a query field of the same name.
        assert_eq!(env["QUERY_ID"], "42");
    }

    #[test]
    fn test_post_and_file_fields() {
        let mut builder = EnvBuilder::default();
        builder.post_fields(&vec![("name".to_string(), strings(&["Widget"]))]);
        builder.files(&vec![
            ("photos[]".to_string(), strings(&["/tmp/a.png", "/tmp/b.png"])),
            ("empty".to_string(), Vec::new()),
        ]);
        let env = builder.build();
        assert_eq!(env["_POST_NAME"], "Widget");
        assert_eq!(env["_FILES_PHOTOS"], "/tmp/a.png /tmp/b.png");
        assert!(!env.contains_key("_FILES_EMPTY"));
    }

    #[test]
    fn test_unrepresentable_variables_skipped() {
        let mut builder = EnvBuilder::default();
        builder.set("A=B", "x");
        builder.set("NUL", "a\0b");
        builder.set("OK", "fine");
        let env = builder.build();
        assert_eq!(env.len(), 1);
        assert_eq!(env["OK"], "fine");
    }
}
