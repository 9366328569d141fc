//! Custom filters for provisioner templates
//!
//! - `tobash`: quote a string or number into a single shell token
//! - `tojson`: embed a value as newline-free JSON

use minijinja::value::ValueKind;
use minijinja::{Error, ErrorKind, Value};

/// Quote a value into a single POSIX shell token.
///
/// Newlines are escaped with ANSI-C quoting (`$'\n'`) so that the result
/// never spans lines; every other segment is single-quoted as needed. For
/// every input `s`, `echo <token>` printed by a POSIX shell equals `s`.
///
/// Usage: `{{ value | tobash }}`
pub fn tobash(value: Value) -> Result<String, Error> {
    let s = stringify_scalar(&value, "tobash")?;

    if s.is_empty() {
        return Ok("''".to_string());
    }

    let token = s
        .split('\n')
        .map(|segment| {
            if segment.is_empty() {
                String::new()
            } else {
                shell_quote(segment)
            }
        })
        .collect::<Vec<_>>()
        .join(r"$'\n'");

    debug_assert!(!token.contains('\n'));
    Ok(token)
}

/// Embed a value as JSON without newline characters.
///
/// Usage: `{{ value | tojson }}`
pub fn tojson(value: Value) -> Result<String, Error> {
    if value.is_undefined() {
        return Err(Error::new(
            ErrorKind::UndefinedError,
            "filter 'tojson' may not be applied to undefined",
        ));
    }

    let json: serde_json::Value = serde_json::to_value(&value).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("tojson serialization error: {e}"),
        )
    })?;

    let out = json.to_string();
    debug_assert!(!out.contains('\n'));
    Ok(out)
}

fn stringify_scalar(value: &Value, filter: &str) -> Result<String, Error> {
    match value.kind() {
        ValueKind::Undefined => Err(Error::new(
            ErrorKind::UndefinedError,
            format!("filter '{filter}' may not be applied to undefined"),
        )),
        ValueKind::String | ValueKind::Number | ValueKind::Bool => Ok(value.to_string()),
        other => Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("filter '{filter}' expects a string or numeric value, got {other}"),
        )),
    }
}

/// Single-quote a string for POSIX shells unless it only contains safe
/// characters. The input must not contain newlines.
fn shell_quote(s: &str) -> String {
    let safe = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));

    if safe && !s.is_empty() {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r#"'"'"'"#))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tobash_empty_string() {
        assert_eq!(tobash(Value::from("")).unwrap(), "''");
    }

    #[test]
    fn tobash_lone_newline() {
        assert_eq!(tobash(Value::from("\n")).unwrap(), r"$'\n'");
    }

    #[test]
    fn tobash_mixed_segments() {
        assert_eq!(tobash(Value::from(" a\nb")).unwrap(), r"' a'$'\n'b");
    }

    #[test]
    fn tobash_numbers() {
        assert_eq!(tobash(Value::from(42)).unwrap(), "42");
        assert_eq!(tobash(Value::from("42")).unwrap(), "42");
    }

    #[test]
    fn tobash_quotes_special_characters() {
        assert_eq!(tobash(Value::from("a b")).unwrap(), "'a b'");
        assert_eq!(tobash(Value::from("it's")).unwrap(), r#"'it'"'"'s'"#);
    }

    #[test]
    fn tobash_never_emits_newlines() {
        let inputs = ["a\nb\nc", "\n\n", "x\n", "\nx"];
        for input in inputs {
            let token = tobash(Value::from(input)).unwrap();
            assert!(!token.contains('\n'), "{token:?}");
        }
    }

    #[test]
    fn tobash_rejects_sequences() {
        let value = Value::from_serialize(vec![42]);
        assert!(tobash(value).is_err());
    }

    #[test]
    fn tobash_rejects_undefined() {
        assert!(tobash(Value::UNDEFINED).is_err());
    }

    #[test]
    fn tojson_escapes_newlines() {
        let out = tojson(Value::from(" a\nb ")).unwrap();
        assert_eq!(out, r#"" a\nb ""#);
    }

    #[test]
    fn tojson_maps_are_single_line() {
        let value = Value::from_serialize(serde_json::json!({"a": "1", "b": 2}));
        let out = tojson(value).unwrap();
        assert_eq!(out, r#"{"a":"1","b":2}"#);
        assert!(!out.contains('\n'));
    }

    #[test]
    fn tojson_rejects_undefined() {
        assert!(tojson(Value::UNDEFINED).is_err());
    }
}
