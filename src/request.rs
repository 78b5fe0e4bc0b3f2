//! Builds outgoing HTTP requests from a tool descriptor and a JSON argument object.

use crate::error::{GeminiError, Result};
use crate::registry::{
    BodyEncoding, HttpMethod, ParamDescriptor, ParamLocation, ToolDescriptor, ValueType,
};
use base64::Engine as _;
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::{Map, Number, Value};
use url::Url;

/// Header carrying the Gemini API key.
pub const API_KEY_HEADER: &str = "x-goog-api-key";

/// Query parameter that, when present, authenticates the request instead of the header.
const API_KEY_QUERY: &str = "key";

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    None,
    Json(Value),
    Binary(Vec<u8>),
}

/// A fully resolved request, ready to hand to the HTTP client.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.as_str().eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.to_str().ok())
    }

    /// Attach the API key header unless the caller authenticated through the `key` query
    /// parameter.
    pub fn apply_api_key(&mut self, api_key: Option<&str>) -> Result<()> {
        let Some(key) = api_key.filter(|k| !k.is_empty()) else {
            return Ok(());
        };
        if self.url.query_pairs().any(|(k, _)| k == API_KEY_QUERY) {
            return Ok(());
        }
        let mut value = HeaderValue::from_str(key)
            .map_err(|_| GeminiError::Config("API key is not a valid header value".into()))?;
        value.set_sensitive(true);
        self.headers
            .push((HeaderName::from_static(API_KEY_HEADER), value));
        Ok(())
    }
}

/// Build the request for `descriptor` from `arguments`.
///
/// `arguments` must be a JSON object (or null). Every required parameter must be present,
/// every value must match its declared type, and unknown arguments are rejected.
pub fn build(base_url: &Url, descriptor: &ToolDescriptor, arguments: &Value) -> Result<HttpRequest> {
    let empty = Map::new();
    let args = match arguments {
        Value::Null => &empty,
        Value::Object(map) => map,
        other => {
            return Err(GeminiError::Validation(format!(
                "Arguments for '{}' must be a JSON object, got {}",
                descriptor.name,
                json_type_name(other)
            )))
        }
    };

    if let Some(unknown) = args.keys().find(|k| descriptor.param(k).is_none()) {
        return Err(GeminiError::Validation(format!(
            "Unknown argument '{unknown}' for tool '{}'",
            descriptor.name
        )));
    }

    let mut path = descriptor.path_template.clone();
    let mut query: Vec<(String, String)> = Vec::new();
    let mut headers: Vec<(HeaderName, HeaderValue)> = Vec::new();
    let mut body_fields = Map::new();
    let mut binary_body: Option<Vec<u8>> = None;

    for param in &descriptor.parameters {
        let value = match args.get(&param.name) {
            Some(Value::Null) | None => param.default.clone(),
            Some(v) => Some(v.clone()),
        };

        let Some(value) = value else {
            if param.required {
                return Err(GeminiError::Validation(format!(
                    "Missing required argument '{}' for tool '{}'",
                    param.name, descriptor.name
                )));
            }
            continue;
        };

        let value = coerce(descriptor, param, value)?;

        match param.location {
            ParamLocation::Path => {
                let segment = path_segment(descriptor, param, &value)?;
                path = path.replace(&format!("{{{}}}", param.wire_name), &segment);
            }
            ParamLocation::Query => match &value {
                Value::Array(items) => {
                    query.extend(items.iter().map(|v| (param.wire_name.clone(), value_to_string(v))));
                }
                scalar => query.push((param.wire_name.clone(), value_to_string(scalar))),
            },
            ParamLocation::Header => headers.push(header_pair(descriptor, param, &value)?),
            ParamLocation::Body => match descriptor.body_encoding {
                BodyEncoding::Binary if param.value_type == ValueType::Binary => {
                    binary_body = Some(decode_binary(descriptor, param, &value)?);
                }
                _ => {
                    body_fields.insert(param.wire_name.clone(), value);
                }
            },
        }
    }

    if path.contains('{') || path.contains('}') {
        return Err(GeminiError::Validation(format!(
            "Unresolved placeholder in path '{path}' for tool '{}'",
            descriptor.name
        )));
    }

    let mut url = Url::parse(&format!("{}{path}", base_url.as_str().trim_end_matches('/')))
        .map_err(|e| GeminiError::Validation(format!("Invalid request URL: {e}")))?;
    if !query.is_empty() {
        url.query_pairs_mut().extend_pairs(query);
    }

    let body = match (descriptor.body_encoding, binary_body) {
        (BodyEncoding::Binary, Some(bytes)) => RequestBody::Binary(bytes),
        _ if !body_fields.is_empty() => RequestBody::Json(Value::Object(body_fields)),
        _ => RequestBody::None,
    };

    Ok(HttpRequest {
        method: descriptor.http_method,
        url,
        headers,
        body,
    })
}

fn coerce(descriptor: &ToolDescriptor, param: &ParamDescriptor, value: Value) -> Result<Value> {
    let coerced = match (param.value_type, value) {
        (ValueType::String | ValueType::Binary, v @ Value::String(_)) => Some(v),
        (ValueType::Integer, Value::Number(n)) if n.is_i64() || n.is_u64() => {
            Some(Value::Number(n))
        }
        (ValueType::Integer, Value::String(s)) => {
            s.trim().parse::<i64>().ok().map(|n| Value::Number(n.into()))
        }
        (ValueType::Number, v @ Value::Number(_)) => Some(v),
        (ValueType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (ValueType::Boolean, v @ Value::Bool(_)) => Some(v),
        (ValueType::Boolean, Value::String(s)) => match s.trim() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        (ValueType::Array, v @ Value::Array(_)) => Some(v),
        (ValueType::Object, v @ Value::Object(_)) => Some(v),
        _ => None,
    };

    coerced.ok_or_else(|| {
        GeminiError::Validation(format!(
            "Type mismatch for argument '{}' of tool '{}': expected {}",
            param.name,
            descriptor.name,
            param.value_type.as_str()
        ))
    })
}

fn path_segment(descriptor: &ToolDescriptor, param: &ParamDescriptor, value: &Value) -> Result<String> {
    let raw = value_to_string(value);
    let raw = param
        .strip_prefix
        .as_deref()
        .and_then(|prefix| raw.strip_prefix(prefix))
        .unwrap_or(&raw);

    // `.` and `..` survive percent-encoding and would be collapsed as dot-segments.
    if raw.is_empty() || raw.contains('/') || raw == "." || raw == ".." {
        return Err(GeminiError::Validation(format!(
            "Argument '{}' of tool '{}' must be a single non-empty path segment",
            param.name, descriptor.name
        )));
    }
    Ok(encode_path_segment(raw))
}

fn header_pair(
    descriptor: &ToolDescriptor,
    param: &ParamDescriptor,
    value: &Value,
) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(param.wire_name.as_bytes()).map_err(|_| {
        GeminiError::Validation(format!(
            "Invalid header name '{}' in tool '{}'",
            param.wire_name, descriptor.name
        ))
    })?;
    let value = HeaderValue::from_str(&value_to_string(value)).map_err(|_| {
        GeminiError::Validation(format!(
            "Argument '{}' of tool '{}' is not a valid header value",
            param.name, descriptor.name
        ))
    })?;
    Ok((name, value))
}

fn decode_binary(descriptor: &ToolDescriptor, param: &ParamDescriptor, value: &Value) -> Result<Vec<u8>> {
    let encoded = value.as_str().unwrap_or_default();
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| {
            GeminiError::Validation(format!(
                "Argument '{}' of tool '{}' is not valid base64: {e}",
                param.name, descriptor.name
            ))
        })
}

fn encode_path_segment(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if matches!(b, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        _ => value.to_string(),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ToolRegistry;
    use serde_json::json;

    fn base() -> Url {
        Url::parse("https://generativelanguage.googleapis.com").expect("base url")
    }

    fn build_for(tool: &str, args: Value) -> Result<HttpRequest> {
        let registry = ToolRegistry::gemini().expect("embedded catalog is valid");
        build(&base(), registry.lookup(tool).expect("declared tool"), &args)
    }

    #[test]
    fn fetch_model_substitutes_model_into_path() {
        let req = build_for("fetch_model", json!({"model": "gemini-1.5-flash"})).expect("build");
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(
            req.url.as_str(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash"
        );
        assert_eq!(req.body, RequestBody::None);
    }

    #[test]
    fn delete_tuned_model_accepts_bare_and_prefixed_names() {
        for name in ["abc", "tunedModels/abc"] {
            let req = build_for("delete_tuned_model", json!({"tunedModel": name})).expect("build");
            assert_eq!(req.method, HttpMethod::Delete);
            assert_eq!(req.url.path(), "/v1beta/tunedModels/abc");
        }
    }

    #[test]
    fn missing_required_argument_is_a_validation_error() {
        let err = build_for("delete_tuned_model", json!({})).expect_err("missing");
        assert!(matches!(&err, GeminiError::Validation(m) if m.contains("tunedModel")), "{err}");

        let err = build_for("text_only_input", json!({"model": "gemini-pro"})).expect_err("missing");
        assert!(matches!(&err, GeminiError::Validation(m) if m.contains("contents")), "{err}");
    }

    #[test]
    fn null_counts_as_absent() {
        let err = build_for("fetch_model", json!({"model": null})).expect_err("null");
        assert!(matches!(err, GeminiError::Validation(_)));

        let req = build_for("fetch_models", json!({"pageSize": null})).expect("optional null");
        assert_eq!(req.url.query(), None);
    }

    #[test]
    fn type_mismatch_is_a_validation_error() {
        let err = build_for("text_tokens", json!({"contents": "hello"})).expect_err("mismatch");
        assert!(err.to_string().contains("expected array"), "{err}");

        let err = build_for("fetch_models", json!({"pageSize": "five"})).expect_err("mismatch");
        assert!(matches!(err, GeminiError::Validation(_)));
    }

    #[test]
    fn non_object_arguments_are_rejected() {
        let err = build_for("fetch_models", json!(["pageSize"])).expect_err("array args");
        assert!(err.to_string().contains("must be a JSON object"), "{err}");
    }

    #[test]
    fn unknown_arguments_are_rejected() {
        let err = build_for("fetch_models", json!({"page": 2})).expect_err("unknown");
        assert!(err.to_string().contains("Unknown argument 'page'"), "{err}");
    }

    #[test]
    fn stringified_integers_are_accepted_for_query_params() {
        let req = build_for("fetch_models", json!({"pageSize": "5", "pageToken": "Chxtb2Rl"}))
            .expect("build");
        assert_eq!(req.url.query(), Some("pageSize=5&pageToken=Chxtb2Rl"));
    }

    #[test]
    fn defaults_fill_path_and_query() {
        let req = build_for(
            "generate_atext_stream",
            json!({"contents": [{"parts": [{"text": "hi"}]}]}),
        )
        .expect("build");
        assert_eq!(
            req.url.path(),
            "/v1beta/models/gemini-1.5-flash-8b-exp-0827:streamGenerateContent"
        );
        assert_eq!(req.url.query(), Some("alt=sse"));
        assert_eq!(
            req.body,
            RequestBody::Json(json!({"contents": [{"parts": [{"text": "hi"}]}]}))
        );
    }

    #[test]
    fn path_values_must_be_single_segments() {
        let err = build_for("fetch_model", json!({"model": "../files/x"})).expect_err("slash");
        assert!(matches!(err, GeminiError::Validation(_)));

        let err = build_for("fetch_model", json!({"model": "models/"})).expect_err("empty");
        assert!(matches!(err, GeminiError::Validation(_)));

        let req = build_for("fetch_model", json!({"model": "a b"})).expect("encoded");
        assert_eq!(req.url.path(), "/v1beta/models/a%20b");
    }

    #[test]
    fn dot_segments_are_rejected_as_path_values() {
        for (tool, arg, value) in [
            ("fetch_model", "model", "."),
            ("fetch_model", "model", ".."),
            ("fetch_model", "model", "models/.."),
            ("delete_tuned_model", "tunedModel", ".."),
            ("delete_tuned_model", "tunedModel", "tunedModels/."),
        ] {
            let err = build_for(tool, json!({ arg: value })).expect_err("dot segment");
            assert!(matches!(err, GeminiError::Validation(_)), "{tool} {value}: {err}");
        }

        let req = build_for("fetch_model", json!({"model": "gemini-1.5-flash..."})).expect("dots");
        assert_eq!(req.url.path(), "/v1beta/models/gemini-1.5-flash...");
    }

    #[test]
    fn body_omits_absent_optional_fields() {
        let req = build_for(
            "create_atuned_model",
            json!({"base_model": "models/gemini-1.5-flash-001-tuning", "tuning_task": {}}),
        )
        .expect("build");
        let RequestBody::Json(body) = req.body else {
            panic!("expected json body");
        };
        assert_eq!(body["base_model"], "models/gemini-1.5-flash-001-tuning");
        assert!(body.get("display_name").is_none());
    }

    #[test]
    fn upload_start_sends_protocol_headers() {
        let req = build_for(
            "resumable_upload_request",
            json!({
                "contentLength": 2048,
                "contentType": "image/jpeg",
                "file": {"display_name": "cat.jpg"}
            }),
        )
        .expect("build");
        assert_eq!(req.header("X-Goog-Upload-Protocol"), Some("resumable"));
        assert_eq!(req.header("X-Goog-Upload-Command"), Some("start"));
        assert_eq!(req.header("X-Goog-Upload-Header-Content-Length"), Some("2048"));
        assert_eq!(req.header("X-Goog-Upload-Header-Content-Type"), Some("image/jpeg"));
        assert_eq!(
            req.body,
            RequestBody::Json(json!({"file": {"display_name": "cat.jpg"}}))
        );
    }

    #[test]
    fn upload_chunk_decodes_binary_body() {
        let req = build_for("upload_image_file", json!({"upload_id": "u-1", "data": "AAEC"}))
            .expect("build");
        assert_eq!(req.body, RequestBody::Binary(vec![0, 1, 2]));
        assert_eq!(req.header("X-Goog-Upload-Command"), Some("upload, finalize"));
        assert_eq!(req.header("X-Goog-Upload-Offset"), Some("0"));
        assert_eq!(req.url.query(), Some("upload_id=u-1&upload_protocol=resumable"));

        let err = build_for("upload_image_file", json!({"upload_id": "u-1", "data": "%%%"}))
            .expect_err("bad base64");
        assert!(err.to_string().contains("base64"), "{err}");
    }

    #[test]
    fn api_key_goes_to_header_unless_key_query_is_given() {
        let mut req = build_for("fetch_models", json!({})).expect("build");
        req.apply_api_key(Some("secret")).expect("valid key");
        assert_eq!(req.header(API_KEY_HEADER), Some("secret"));

        let mut req = build_for(
            "text_only_input",
            json!({"key": "caller-key", "contents": []}),
        )
        .expect("build");
        req.apply_api_key(Some("secret")).expect("valid key");
        assert_eq!(req.header(API_KEY_HEADER), None);
        assert_eq!(req.url.query(), Some("key=caller-key"));

        let mut req = build_for("fetch_models", json!({})).expect("build");
        req.apply_api_key(None).expect("no key");
        assert!(req.headers.is_empty());
    }

    #[test]
    fn base_url_path_prefix_is_kept() {
        let registry = ToolRegistry::gemini().expect("embedded catalog is valid");
        let base = Url::parse("http://127.0.0.1:8080/proxy/").expect("base");
        let req = build(
            &base,
            registry.lookup("discovery_document").expect("discovery"),
            &json!({"version": "v1beta"}),
        )
        .expect("build");
        assert_eq!(
            req.url.as_str(),
            "http://127.0.0.1:8080/proxy/$discovery/rest?version=v1beta"
        );
    }

    fn sample_value(value_type: ValueType) -> Value {
        match value_type {
            ValueType::String => json!("x"),
            ValueType::Integer => json!(1),
            ValueType::Number => json!(1.5),
            ValueType::Boolean => json!(true),
            ValueType::Array => json!([]),
            ValueType::Object => json!({}),
            ValueType::Binary => json!("AA=="),
        }
    }

    #[test]
    fn every_tool_resolves_all_placeholders() {
        let registry = ToolRegistry::gemini().expect("embedded catalog is valid");
        for tool in registry.iter() {
            let args: Map<String, Value> = tool
                .parameters
                .iter()
                .filter(|p| p.required && p.default.is_none())
                .map(|p| (p.name.clone(), sample_value(p.value_type)))
                .collect();
            let req = build(&base(), tool, &Value::Object(args))
                .unwrap_or_else(|e| panic!("{}: {e}", tool.name));
            assert!(!req.url.path().contains('{'), "{}", tool.name);
            assert!(!req.url.path().contains("%7B"), "{}", tool.name);
        }
    }
}
