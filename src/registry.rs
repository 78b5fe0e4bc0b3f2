//! Tool registry built from an OpenAPI-style catalog document.
//!
//! Every `(path, method)` operation in the catalog becomes one [`ToolDescriptor`], named by its
//! `operationId`. The registry is validated once at startup and is read-only afterwards.

use crate::error::{GeminiError, Result};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// The Gemini API catalog compiled into the binary.
pub const GEMINI_CATALOG: &str = include_str!("../catalog/gemini.yaml");

const JSON_MEDIA_TYPE: &str = "application/json";
const BINARY_MEDIA_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }

    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

impl FromStr for HttpMethod {
    type Err = GeminiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "get" => Ok(Self::Get),
            "post" => Ok(Self::Post),
            "delete" => Ok(Self::Delete),
            other => Err(GeminiError::Schema(format!(
                "Unsupported HTTP method '{other}'"
            ))),
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an argument ends up in the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamLocation {
    Path,
    Query,
    Header,
    Body,
}

impl FromStr for ParamLocation {
    type Err = GeminiError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "path" => Ok(Self::Path),
            "query" => Ok(Self::Query),
            "header" => Ok(Self::Header),
            "body" => Ok(Self::Body),
            other => Err(GeminiError::Schema(format!(
                "Unsupported parameter location '{other}'"
            ))),
        }
    }
}

/// Declared JSON type of an argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    /// Base64 string sent as raw bytes.
    Binary,
}

impl ValueType {
    fn from_schema(schema: &Value) -> Result<Self> {
        let format = schema.get("format").and_then(Value::as_str);
        match schema.get("type").and_then(Value::as_str) {
            None => Ok(Self::String),
            Some("string") if format == Some("byte") || format == Some("binary") => {
                Ok(Self::Binary)
            }
            Some("string") => Ok(Self::String),
            Some("integer") => Ok(Self::Integer),
            Some("number") => Ok(Self::Number),
            Some("boolean") => Ok(Self::Boolean),
            Some("array") => Ok(Self::Array),
            Some("object") => Ok(Self::Object),
            Some(other) => Err(GeminiError::Schema(format!(
                "Unsupported schema type '{other}'"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::String | Self::Binary => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// How the request body is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyEncoding {
    Json,
    Binary,
}

#[derive(Debug, Clone)]
pub struct ParamDescriptor {
    /// Argument name exposed to callers.
    pub name: String,
    /// Name on the wire (placeholder, query key, header name or body field).
    pub wire_name: String,
    pub location: ParamLocation,
    pub required: bool,
    pub value_type: ValueType,
    pub default: Option<Value>,
    /// Resource prefix removed from path values, e.g. `models/`.
    pub strip_prefix: Option<String>,
    pub description: Option<String>,
    /// JSON Schema fragment advertised for this argument.
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub http_method: HttpMethod,
    pub path_template: String,
    pub parameters: Vec<ParamDescriptor>,
    pub description: String,
    pub streaming: bool,
    pub body_encoding: BodyEncoding,
}

impl ToolDescriptor {
    pub fn param(&self, name: &str) -> Option<&ParamDescriptor> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// JSON Schema describing the tool's argument object.
    pub fn input_schema(&self) -> Map<String, Value> {
        let mut properties = Map::new();
        let mut required: Vec<Value> = Vec::new();

        for param in &self.parameters {
            let mut prop = param.schema.clone();
            if !prop.is_object() {
                prop = json!({ "type": param.value_type.as_str() });
            }
            if let Some(obj) = prop.as_object_mut() {
                if let Some(description) = &param.description {
                    obj.entry("description")
                        .or_insert_with(|| Value::String(description.clone()));
                }
                if param.value_type == ValueType::Binary {
                    obj.insert("contentEncoding".into(), json!("base64"));
                }
                if let Some(default) = &param.default {
                    obj.insert("default".into(), default.clone());
                }
            }
            properties.insert(param.name.clone(), prop);

            if param.required && param.default.is_none() {
                required.push(Value::String(param.name.clone()));
            }
        }

        let mut schema = Map::new();
        schema.insert("type".into(), json!("object"));
        schema.insert("properties".into(), Value::Object(properties));
        if !required.is_empty() {
            schema.insert("required".into(), Value::Array(required));
        }
        schema.insert("additionalProperties".into(), json!(false));
        schema
    }

    fn validate(&self) -> Result<()> {
        if self.path_template.is_empty() || !self.path_template.starts_with('/') {
            return Err(GeminiError::Schema(format!(
                "Tool '{}' has invalid path '{}'",
                self.name, self.path_template
            )));
        }

        let placeholders = path_placeholders(&self.path_template).map_err(|e| {
            GeminiError::Schema(format!("Tool '{}': {e}", self.name))
        })?;

        let mut names: HashSet<&str> = HashSet::new();
        for param in &self.parameters {
            if !names.insert(param.name.as_str()) {
                return Err(GeminiError::Schema(format!(
                    "Tool '{}' declares argument '{}' twice",
                    self.name, param.name
                )));
            }
            if param.location == ParamLocation::Path {
                if !placeholders.contains(&param.wire_name.as_str()) {
                    return Err(GeminiError::Schema(format!(
                        "Tool '{}': path parameter '{}' has no placeholder in '{}'",
                        self.name, param.wire_name, self.path_template
                    )));
                }
                if !param.required && param.default.is_none() {
                    return Err(GeminiError::Schema(format!(
                        "Tool '{}': path parameter '{}' must be required or have a default",
                        self.name, param.wire_name
                    )));
                }
            }
        }

        for placeholder in placeholders {
            let declared = self
                .parameters
                .iter()
                .any(|p| p.location == ParamLocation::Path && p.wire_name == placeholder);
            if !declared {
                return Err(GeminiError::Schema(format!(
                    "Tool '{}': placeholder '{{{placeholder}}}' has no path parameter",
                    self.name
                )));
            }
        }

        let binary_params = self
            .parameters
            .iter()
            .filter(|p| p.value_type == ValueType::Binary)
            .count();
        if self.body_encoding == BodyEncoding::Binary {
            let body_params = self
                .parameters
                .iter()
                .filter(|p| p.location == ParamLocation::Body)
                .count();
            if binary_params != 1 || body_params != 1 {
                return Err(GeminiError::Schema(format!(
                    "Tool '{}': binary request body must declare exactly one byte-string property",
                    self.name
                )));
            }
        }

        Ok(())
    }
}

/// Extracts `{name}` placeholders from a path template.
pub(crate) fn path_placeholders(path: &str) -> std::result::Result<Vec<&str>, String> {
    let mut out = Vec::new();
    let mut rest = path;
    while let Some(start) = rest.find('{') {
        if rest[..start].contains('}') {
            return Err(format!("unbalanced '}}' in path '{path}'"));
        }
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in path '{path}'"))?;
        let name = &after[..end];
        if name.is_empty() || name.contains('{') {
            return Err(format!("malformed placeholder in path '{path}'"));
        }
        out.push(name);
        rest = &after[end + 1..];
    }
    if rest.contains('}') {
        return Err(format!("unbalanced '}}' in path '{path}'"));
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Registry for the embedded Gemini catalog.
    pub fn gemini() -> Result<Self> {
        Self::from_catalog_str(GEMINI_CATALOG)
    }

    /// Load a catalog document (YAML or JSON) from disk.
    pub fn from_catalog_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_catalog_str(&text)
    }

    pub fn from_catalog_str(text: &str) -> Result<Self> {
        let doc: CatalogDocument = serde_yaml::from_str(text)?;
        Self::from_descriptors(doc.into_descriptors()?)
    }

    pub fn from_descriptors(tools: Vec<ToolDescriptor>) -> Result<Self> {
        let mut index = HashMap::with_capacity(tools.len());
        for (i, tool) in tools.iter().enumerate() {
            if tool.name.trim().is_empty() {
                return Err(GeminiError::Schema(format!(
                    "Tool at '{}' has an empty name",
                    tool.path_template
                )));
            }
            tool.validate()?;
            if index.insert(tool.name.clone(), i).is_some() {
                return Err(GeminiError::Schema(format!(
                    "Duplicate tool name '{}'",
                    tool.name
                )));
            }
        }
        Ok(Self { tools, index })
    }

    pub fn lookup(&self, name: &str) -> Result<&ToolDescriptor> {
        self.index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| GeminiError::NotFound(name.to_string()))
    }

    /// Tools in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    paths: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOperation {
    #[serde(default)]
    operation_id: Option<String>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Vec<RawParameter>,
    #[serde(default)]
    request_body: Option<RawRequestBody>,
    #[serde(default, rename = "x-streaming")]
    streaming: bool,
}

#[derive(Debug, Deserialize)]
struct RawParameter {
    name: String,
    #[serde(rename = "in")]
    location: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    schema: Option<Value>,
    #[serde(default, rename = "x-argument")]
    argument: Option<String>,
    #[serde(default, rename = "x-strip-prefix")]
    strip_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRequestBody {
    #[serde(default)]
    content: Map<String, Value>,
}

impl CatalogDocument {
    fn into_descriptors(self) -> Result<Vec<ToolDescriptor>> {
        let mut out = Vec::new();
        for (key, item) in self.paths {
            // `#suffix` only disambiguates keys.
            let path = key.split('#').next().unwrap_or_default().to_string();
            let Value::Object(operations) = item else {
                return Err(GeminiError::Schema(format!(
                    "Path item '{key}' must be a mapping of HTTP methods"
                )));
            };
            for (method, op) in operations {
                let http_method: HttpMethod = method
                    .parse()
                    .map_err(|e| GeminiError::Schema(format!("Path '{key}': {e}")))?;
                let op: RawOperation = serde_json::from_value(op).map_err(|e| {
                    GeminiError::Schema(format!("Operation {method} '{key}': {e}"))
                })?;
                out.push(op.into_descriptor(http_method, &path)?);
            }
        }
        Ok(out)
    }
}

impl RawOperation {
    fn into_descriptor(self, http_method: HttpMethod, path: &str) -> Result<ToolDescriptor> {
        let name = self
            .operation_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                GeminiError::Schema(format!(
                    "Operation {http_method} '{path}' is missing an operationId"
                ))
            })?;

        let mut parameters = Vec::with_capacity(self.parameters.len());
        for raw in self.parameters {
            let location: ParamLocation = raw.location.parse()?;
            let schema = raw.schema.unwrap_or_else(|| json!({ "type": "string" }));
            let value_type = ValueType::from_schema(&schema)
                .map_err(|e| GeminiError::Schema(format!("Tool '{name}', '{}': {e}", raw.name)))?;
            parameters.push(ParamDescriptor {
                name: raw.argument.unwrap_or_else(|| raw.name.clone()),
                default: schema.get("default").cloned(),
                wire_name: raw.name,
                location,
                required: raw.required,
                value_type,
                strip_prefix: raw.strip_prefix,
                description: raw.description,
                schema,
            });
        }

        let mut body_encoding = BodyEncoding::Json;
        if let Some(body) = self.request_body {
            let (encoding, schema) = body_schema(&name, &body)?;
            body_encoding = encoding;
            parameters.extend(body_parameters(&name, schema)?);
        }

        let description = self
            .description
            .or(self.summary)
            .unwrap_or_default()
            .trim()
            .to_string();

        Ok(ToolDescriptor {
            name,
            http_method,
            path_template: path.to_string(),
            parameters,
            description,
            streaming: self.streaming,
            body_encoding,
        })
    }
}

fn body_schema<'a>(tool: &str, body: &'a RawRequestBody) -> Result<(BodyEncoding, &'a Value)> {
    let (encoding, media) = if let Some(media) = body.content.get(JSON_MEDIA_TYPE) {
        (BodyEncoding::Json, media)
    } else if let Some(media) = body.content.get(BINARY_MEDIA_TYPE) {
        (BodyEncoding::Binary, media)
    } else {
        return Err(GeminiError::Schema(format!(
            "Tool '{tool}': request body must be {JSON_MEDIA_TYPE} or {BINARY_MEDIA_TYPE}"
        )));
    };
    let schema = media.get("schema").ok_or_else(|| {
        GeminiError::Schema(format!("Tool '{tool}': request body has no schema"))
    })?;
    Ok((encoding, schema))
}

fn body_parameters(tool: &str, schema: &Value) -> Result<Vec<ParamDescriptor>> {
    let required: HashSet<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };

    let mut out = Vec::with_capacity(properties.len());
    for (field, prop) in properties {
        let value_type = ValueType::from_schema(prop)
            .map_err(|e| GeminiError::Schema(format!("Tool '{tool}', body field '{field}': {e}")))?;
        out.push(ParamDescriptor {
            name: field.clone(),
            wire_name: field.clone(),
            location: ParamLocation::Body,
            required: required.contains(field.as_str()),
            value_type,
            default: prop.get("default").cloned(),
            strip_prefix: None,
            description: prop
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            schema: prop.clone(),
        });
    }
    Ok(out)
}
