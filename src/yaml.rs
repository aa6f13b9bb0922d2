//! YAML decoding for rendered manifests
//!
//! Controllers render their children from templates into multi-document
//! YAML. Documents are parsed with yaml-rust2 and converted to
//! `serde_json::Value` so everything downstream works on one value type.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

use crate::{Error, Result};

/// Parse every non-empty document of a YAML (or JSON) string.
///
/// Empty documents, e.g. a trailing `---` or a template branch that rendered
/// nothing, are skipped.
pub fn parse_documents(input: &str) -> Result<Vec<Value>> {
    let docs = YamlLoader::load_from_str(input)
        .map_err(|e| Error::validation(format!("invalid yaml: {}", e)))?;

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match yaml_to_json(doc)? {
            Value::Null => continue,
            Value::Object(map) if map.is_empty() => continue,
            value => out.push(value),
        }
    }
    Ok(out)
}

/// Parse a single document, `Value::Null` for empty input
pub fn parse_document(input: &str) -> Result<Value> {
    Ok(parse_documents(input)?.into_iter().next().unwrap_or(Value::Null))
}

fn yaml_to_json(yaml: Yaml) -> Result<Value> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|_| Error::validation(format!("invalid float {:?}", s)))?;
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| Error::validation(format!("float {} is out of range", s)))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    _ => return Err(Error::validation("unsupported yaml key type")),
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(Error::validation("yaml aliases are not supported")),
        Yaml::BadValue => Err(Error::validation("bad yaml value")),
    }
}
