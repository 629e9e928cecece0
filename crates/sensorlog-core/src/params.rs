//! Keyword parameters for transforms and calculated fields.
//!
//! Parameters arrive either as a keyword string (`"slope=0.5, id_flow=abc,
//! enabled=yes"`) or as a TOML table. Both produce an ordered [`Params`] list;
//! declaration order matters because the first `id_` parameter is the default
//! synchronization anchor.

use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Prefix marking a parameter whose value is a series key.
pub const ID_PREFIX: &str = "id_";

/// Suffix (after [`ID_PREFIX`]) marking the synchronization anchor.
pub const SYNC_SUFFIX: &str = "_sync";

/// A single parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ParamValue {
    /// Interpret a bare keyword-string value.
    fn from_keyword(name: &str, raw: &str) -> Self {
        let raw = raw.trim();
        if name.starts_with(ID_PREFIX) {
            return ParamValue::Text(strip_quotes(raw).to_string());
        }
        if let Ok(v) = raw.parse::<f64>() {
            return ParamValue::Number(v);
        }
        match raw {
            "True" | "true" | "Y" | "y" | "Yes" | "yes" => ParamValue::Bool(true),
            "False" | "false" | "N" | "n" | "No" | "no" => ParamValue::Bool(false),
            _ => ParamValue::Text(strip_quotes(raw).to_string()),
        }
    }

    /// Render as a string (used for series keys given as numbers in TOML).
    pub fn as_text(&self) -> String {
        match self {
            ParamValue::Text(s) => s.clone(),
            ParamValue::Number(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", *v as i64),
            ParamValue::Number(v) => v.to_string(),
            ParamValue::Bool(b) => b.to_string(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Text(s) => write!(f, "{s:?}"),
            other => f.write_str(&other.as_text()),
        }
    }
}

fn strip_quotes(s: &str) -> &str {
    s.trim_matches(|c| c == '"' || c == '\'')
}

/// Ordered keyword parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(String, ParamValue)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `"name=value, name=value"`.
    ///
    /// Numbers become [`ParamValue::Number`], yes/no/true/false words become
    /// [`ParamValue::Bool`], and everything else (including every `id_` value)
    /// becomes [`ParamValue::Text`] with surrounding quotes removed. Commas
    /// inside parentheses do not split, so `expression=max(a, b)` survives.
    pub fn parse(s: &str) -> Result<Self> {
        let mut params = Params::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(params);
        }
        for item in split_top_level(s) {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (name, raw) = item
                .split_once('=')
                .ok_or_else(|| Error::Params(format!("expected name=value, got '{item}'")))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::Params(format!("missing parameter name in '{item}'")));
            }
            params.insert(name, ParamValue::from_keyword(name, raw));
        }
        Ok(params)
    }

    /// Insert or replace `name`, keeping its original position on replace.
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Numeric parameter, or `default` when absent.
    pub fn f64_or(&self, name: &str, default: f64) -> Result<f64> {
        match self.get(name) {
            None => Ok(default),
            Some(ParamValue::Number(v)) => Ok(*v),
            Some(ParamValue::Bool(b)) => Ok(if *b { 1.0 } else { 0.0 }),
            Some(ParamValue::Text(s)) => s
                .trim()
                .parse()
                .map_err(|_| Error::Params(format!("'{name}' must be a number, got '{s}'"))),
        }
    }

    /// Numeric parameter that must be present.
    pub fn f64_required(&self, name: &str) -> Result<f64> {
        if !self.contains(name) {
            return Err(Error::Params(format!("missing required parameter '{name}'")));
        }
        self.f64_or(name, 0.0)
    }

    /// Boolean parameter, or `default` when absent. Numbers are true when non-zero.
    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool> {
        match self.get(name) {
            None => Ok(default),
            Some(ParamValue::Bool(b)) => Ok(*b),
            Some(ParamValue::Number(v)) => Ok(*v != 0.0),
            Some(ParamValue::Text(s)) => Err(Error::Params(format!(
                "'{name}' must be a boolean, got '{s}'"
            ))),
        }
    }

    /// Text parameter, or `None` when absent.
    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).map(ParamValue::as_text)
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}

/// Split on commas that are not nested inside parentheses.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            ',' if depth <= 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

// ---------------------------------------------------------------------------
// Serde: accept either a keyword string or a table
// ---------------------------------------------------------------------------

impl<'de> Deserialize<'de> for Params {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ParamsVisitor;

        impl<'de> Visitor<'de> for ParamsVisitor {
            type Value = Params;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a keyword string or a table of parameters")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Params, E> {
                Params::parse(v).map_err(E::custom)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Params, A::Error> {
                let mut params = Params::new();
                while let Some((name, value)) = map.next_entry::<String, ParamValue>()? {
                    params.insert(name, value);
                }
                Ok(params)
            }
        }

        deserializer.deserialize_any(ParamsVisitor)
    }
}

impl Serialize for Params {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in &self.entries {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mixed_types() {
        let p = Params::parse(r#"abc=True, xyz=23.3, jlk="Hello""#).unwrap();
        assert_eq!(p.get("abc"), Some(&ParamValue::Bool(true)));
        assert_eq!(p.get("xyz"), Some(&ParamValue::Number(23.3)));
        assert_eq!(p.get("jlk"), Some(&ParamValue::Text("Hello".into())));
    }

    #[test]
    fn test_parse_yes_no_and_bare_strings() {
        let p = Params::parse("abc=Yes, off=n, jlk='Hello', other=World").unwrap();
        assert!(p.bool_or("abc", false).unwrap());
        assert!(!p.bool_or("off", true).unwrap());
        assert_eq!(p.text("jlk").as_deref(), Some("Hello"));
        assert_eq!(p.text("other").as_deref(), Some("World"));
    }

    #[test]
    fn test_id_values_always_text() {
        let p = Params::parse("id_flow=12345, id_temp_sync='abc'").unwrap();
        assert_eq!(p.get("id_flow"), Some(&ParamValue::Text("12345".into())));
        assert_eq!(p.get("id_temp_sync"), Some(&ParamValue::Text("abc".into())));
    }

    #[test]
    fn test_parse_empty_and_malformed() {
        assert!(Params::parse("   ").unwrap().is_empty());
        assert!(Params::parse("slope").is_err());
        assert!(Params::parse("=3").is_err());
    }

    #[test]
    fn test_nested_commas_preserved() {
        let p = Params::parse("expression=max(rate, 0) * 2, rollover=65536").unwrap();
        assert_eq!(p.text("expression").as_deref(), Some("max(rate, 0) * 2"));
        assert_eq!(p.f64_or("rollover", 0.0).unwrap(), 65536.0);
    }

    #[test]
    fn test_defaults_and_type_errors() {
        let p = Params::parse("slope=abc").unwrap();
        assert_eq!(p.f64_or("offset", 1.5).unwrap(), 1.5);
        assert!(p.f64_or("slope", 1.0).is_err());
        assert!(p.f64_required("missing").is_err());
    }

    #[test]
    fn test_order_preserved_from_toml_table() {
        #[derive(Deserialize)]
        struct Wrapper {
            params: Params,
        }
        let w: Wrapper =
            toml::from_str("params = { id_b = \"b\", id_a = \"a\", multiplier = 500.0 }").unwrap();
        let names: Vec<&str> = w.params.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["id_b", "id_a", "multiplier"]);
    }

    #[test]
    fn test_keyword_string_in_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            params: Params,
        }
        let w: Wrapper = toml::from_str("params = \"slope=2, offset=-1\"").unwrap();
        assert_eq!(w.params.f64_or("slope", 1.0).unwrap(), 2.0);
        assert_eq!(w.params.f64_or("offset", 0.0).unwrap(), -1.0);
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let p = Params::parse("slope=2, enabled=true, id_x=abc").unwrap();
        assert_eq!(p.to_string(), "slope=2, enabled=true, id_x=\"abc\"");
        assert_eq!(Params::parse(&p.to_string()).unwrap(), p);
    }
}
