//! JSON codec for prediction requests and responses
//!
//! Request bodies use the protobuf JSON mapping of `PredictRequest`: field names
//! in lowerCamelCase (the original snake_case names are accepted too), int64
//! values as numbers or strings, `dataType` as a number or enum name, bytes as
//! base64. Input keys keep their order, duplicates included.

use crate::error::ServingError;
use crate::executor::InferenceRequest;
use crate::grpc::proto::onnx::TensorProto;
use crate::grpc::proto::onnx::tensor_proto::DataType;
use crate::grpc::proto::serving::v1::PredictResponse;
use axum::http::StatusCode;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Write};
use std::str::FromStr;

/// Characters shown either side of a parse error
const SNIPPET_CONTEXT: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonPredictRequest {
    #[serde(default, deserialize_with = "ordered_inputs")]
    inputs: Vec<(String, JsonTensor)>,

    #[serde(default, alias = "output_filter")]
    output_filter: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonPredictResponse {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    outputs: BTreeMap<String, JsonTensor>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct JsonTensor {
    #[serde(
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "i64_as_strings",
        deserialize_with = "numbers"
    )]
    dims: Vec<i64>,

    #[serde(
        alias = "data_type",
        skip_serializing_if = "is_undefined",
        deserialize_with = "data_type_tag"
    )]
    data_type: i32,

    #[serde(skip_serializing_if = "String::is_empty")]
    name: String,

    #[serde(
        alias = "raw_data",
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "base64_bytes",
        deserialize_with = "from_base64"
    )]
    raw_data: Vec<u8>,

    #[serde(
        alias = "float_data",
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "f32_values",
        deserialize_with = "numbers"
    )]
    float_data: Vec<f32>,

    #[serde(
        alias = "int32_data",
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "numbers"
    )]
    int32_data: Vec<i32>,

    #[serde(
        alias = "string_data",
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "base64_list",
        deserialize_with = "from_base64_list"
    )]
    string_data: Vec<Vec<u8>>,

    #[serde(
        alias = "int64_data",
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "i64_as_strings",
        deserialize_with = "numbers"
    )]
    int64_data: Vec<i64>,

    #[serde(
        alias = "double_data",
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "f64_values",
        deserialize_with = "numbers"
    )]
    double_data: Vec<f64>,

    #[serde(
        alias = "uint64_data",
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "u64_as_strings",
        deserialize_with = "numbers"
    )]
    uint64_data: Vec<u64>,
}

impl From<JsonTensor> for TensorProto {
    fn from(tensor: JsonTensor) -> Self {
        TensorProto {
            dims: tensor.dims,
            data_type: tensor.data_type,
            name: tensor.name,
            raw_data: tensor.raw_data,
            float_data: tensor.float_data,
            int32_data: tensor.int32_data,
            string_data: tensor.string_data,
            int64_data: tensor.int64_data,
            double_data: tensor.double_data,
            uint64_data: tensor.uint64_data,
        }
    }
}

impl From<&TensorProto> for JsonTensor {
    fn from(proto: &TensorProto) -> Self {
        JsonTensor {
            dims: proto.dims.clone(),
            data_type: proto.data_type,
            name: proto.name.clone(),
            raw_data: proto.raw_data.clone(),
            float_data: proto.float_data.clone(),
            int32_data: proto.int32_data.clone(),
            string_data: proto.string_data.clone(),
            int64_data: proto.int64_data.clone(),
            double_data: proto.double_data.clone(),
            uint64_data: proto.uint64_data.clone(),
        }
    }
}

/// Parse a JSON request body
///
/// Unknown fields are ignored. Parse failures become `InvalidArgument` with the
/// field path, the parser's reason and a caret under the offending column.
pub fn decode_request(body: &[u8]) -> Result<InferenceRequest, ServingError> {
    let mut deserializer = serde_json::Deserializer::from_slice(body);
    let request: JsonPredictRequest = serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|err| parse_error(body, &err.path().to_string(), err.inner()))?;
    deserializer
        .end()
        .map_err(|err| parse_error(body, ".", &err))?;

    Ok(InferenceRequest {
        inputs: request
            .inputs
            .into_iter()
            .map(|(name, tensor)| (name, tensor.into()))
            .collect(),
        output_filter: request.output_filter,
    })
}

/// Serialize a response body with output names in sorted order
pub fn encode_response(response: &PredictResponse) -> Result<Vec<u8>, ServingError> {
    let body = JsonPredictResponse {
        outputs: response
            .outputs
            .iter()
            .map(|(name, tensor)| (name.clone(), JsonTensor::from(tensor)))
            .collect(),
    };

    serde_json::to_vec(&body)
        .map_err(|e| ServingError::Internal(format!("failed to serialize response: {e}")))
}

/// Parse a response body produced by [`encode_response`]
pub fn decode_response(body: &[u8]) -> Result<PredictResponse, ServingError> {
    let mut deserializer = serde_json::Deserializer::from_slice(body);
    let response: JsonPredictResponse = serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|err| parse_error(body, &err.path().to_string(), err.inner()))?;

    Ok(PredictResponse {
        outputs: response
            .outputs
            .into_iter()
            .map(|(name, tensor)| (name, tensor.into()))
            .collect(),
    })
}

/// Error body: `{"error_code": <status>, "error_message": "<escaped>"}` plus newline
pub fn encode_error(status: StatusCode, message: &str) -> String {
    format!(
        "{{\"error_code\": {}, \"error_message\": \"{}\"}}\n",
        status.as_u16(),
        escape(message)
    )
}

/// Escape text for embedding in a JSON string literal
///
/// NUL characters are dropped.
pub fn escape(message: &str) -> String {
    let mut escaped = String::with_capacity(message.len());
    for c in message.chars() {
        match c {
            '\0' => {}
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            '\u{08}' => escaped.push_str("\\b"),
            '\u{0c}' => escaped.push_str("\\f"),
            c if c < '\u{20}' => {
                let _ = write!(escaped, "\\u{:04x}", c as u32);
            }
            c => escaped.push(c),
        }
    }
    escaped
}

fn parse_error(body: &[u8], path: &str, err: &serde_json::Error) -> ServingError {
    let mut message = String::new();
    if path != "." && path != "?" {
        message.push_str(path);
        message.push_str(": ");
    }
    message.push_str(&err.to_string());
    message.push('\n');
    message.push_str(&caret_snippet(body, err.line(), err.column()));
    ServingError::InvalidArgument(message)
}

/// Window of the offending line with a caret under `column` (1-based)
fn caret_snippet(body: &[u8], line: usize, column: usize) -> String {
    let text = String::from_utf8_lossy(body);
    let line_text = text.lines().nth(line.saturating_sub(1)).unwrap_or("");

    let error_at = char_boundary(line_text, column.saturating_sub(1));
    let start = char_boundary(line_text, error_at.saturating_sub(SNIPPET_CONTEXT));
    let end = char_boundary(line_text, error_at + SNIPPET_CONTEXT);
    let caret_offset = line_text[start..error_at].chars().count();

    format!("{}\n{}^", &line_text[start..end], " ".repeat(caret_offset))
}

/// Largest char boundary not after `index`, clamped to the string length
fn char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ordered_inputs<'de, D>(deserializer: D) -> Result<Vec<(String, JsonTensor)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct InputsVisitor;

    impl<'de> Visitor<'de> for InputsVisitor {
        type Value = Vec<(String, JsonTensor)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of input names to tensors")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut inputs = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((name, tensor)) = map.next_entry::<String, JsonTensor>()? {
                inputs.push((name, tensor));
            }
            Ok(inputs)
        }
    }

    deserializer.deserialize_map(InputsVisitor)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString<T> {
    Number(T),
    String(String),
}

/// Numbers given as JSON numbers or strings ("12", "NaN", "-Infinity")
fn numbers<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: fmt::Display,
{
    Vec::<NumberOrString<T>>::deserialize(deserializer)?
        .into_iter()
        .map(|value| match value {
            NumberOrString::Number(number) => Ok(number),
            NumberOrString::String(text) => text
                .parse()
                .map_err(|e| de::Error::custom(format!("invalid number \"{text}\": {e}"))),
        })
        .collect()
}

fn data_type_tag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i32, D::Error> {
    match NumberOrString::<i32>::deserialize(deserializer)? {
        NumberOrString::Number(tag) => Ok(tag),
        NumberOrString::String(name) => DataType::from_str_name(&name)
            .map(|data_type| data_type as i32)
            .or_else(|| name.parse().ok())
            .ok_or_else(|| de::Error::custom(format!("unknown data type \"{name}\""))),
    }
}

fn decode_base64(text: &str) -> Result<Vec<u8>, String> {
    STANDARD
        .decode(text)
        .or_else(|_| URL_SAFE.decode(text))
        .map_err(|e| {
            let shown: String = text.chars().take(32).collect();
            format!("invalid base64 value \"{shown}\": {e}")
        })
}

fn from_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    decode_base64(&text).map_err(de::Error::custom)
}

fn from_base64_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Vec<u8>>, D::Error> {
    Vec::<String>::deserialize(deserializer)?
        .iter()
        .map(|text| decode_base64(text).map_err(de::Error::custom))
        .collect()
}

fn is_undefined(data_type: &i32) -> bool {
    *data_type == DataType::Undefined as i32
}

fn i64_as_strings<S: Serializer>(values: &[i64], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(values.iter().map(i64::to_string))
}

fn u64_as_strings<S: Serializer>(values: &[u64], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(values.iter().map(u64::to_string))
}

fn base64_bytes<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(bytes))
}

fn base64_list<S: Serializer>(values: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(values.iter().map(|bytes| STANDARD.encode(bytes)))
}

/// Float that serializes non-finite values as "NaN", "Infinity", "-Infinity"
struct JsonFloat(f64);

impl Serialize for JsonFloat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            v if v.is_nan() => serializer.serialize_str("NaN"),
            v if v == f64::INFINITY => serializer.serialize_str("Infinity"),
            v if v == f64::NEG_INFINITY => serializer.serialize_str("-Infinity"),
            v => serializer.serialize_f64(v),
        }
    }
}

struct JsonFloat32(f32);

impl Serialize for JsonFloat32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_finite() {
            serializer.serialize_f32(self.0)
        } else {
            JsonFloat(f64::from(self.0)).serialize(serializer)
        }
    }
}

fn f32_values<S: Serializer>(values: &[f32], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(values.iter().map(|&v| JsonFloat32(v)))
}

fn f64_values<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(values.iter().map(|&v| JsonFloat(v)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MNIST_REQUEST: &str = r#"{"inputs":{"Input3":{"dims":["1","1","2","2"],"dataType":1,"rawData":"AACAPwAAAEAAAEBAAACAQA=="}},"outputFilter":["Plus214_Output_0"]}"#;

    #[test]
    fn test_decode_request() {
        let request = decode_request(MNIST_REQUEST.as_bytes()).unwrap();
        assert_eq!(request.inputs.len(), 1);

        let (name, tensor) = &request.inputs[0];
        assert_eq!(name, "Input3");
        assert_eq!(tensor.dims, vec![1, 1, 2, 2]);
        assert_eq!(tensor.data_type, DataType::Float as i32);
        assert_eq!(tensor.raw_data.len(), 16);
        assert_eq!(&tensor.raw_data[..4], &1.0f32.to_le_bytes());
        assert_eq!(request.output_filter, vec!["Plus214_Output_0"]);
    }

    #[test]
    fn test_decode_snake_case_and_typed_values() {
        let body = r#"{
            "inputs": {
                "X": {"dims": [3, 2], "data_type": "FLOAT", "float_data": [1, 2.5, "NaN", "Infinity", -1, 0]}
            },
            "output_filter": ["Y"]
        }"#;

        let request = decode_request(body.as_bytes()).unwrap();
        let tensor = &request.inputs[0].1;
        assert_eq!(tensor.dims, vec![3, 2]);
        assert_eq!(tensor.data_type, DataType::Float as i32);
        assert_eq!(tensor.float_data[1], 2.5);
        assert!(tensor.float_data[2].is_nan());
        assert_eq!(tensor.float_data[3], f32::INFINITY);
        assert_eq!(request.output_filter, vec!["Y"]);
    }

    #[test]
    fn test_decode_keeps_duplicate_inputs() {
        let body = r#"{"inputs":{"X":{"dims":[1]},"X":{"dims":[2]}}}"#;
        let request = decode_request(body.as_bytes()).unwrap();
        let names: Vec<_> = request.inputs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["X", "X"]);
        assert_eq!(request.inputs[1].1.dims, vec![2]);
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let body = r#"{"inputs":{"X":{"dims":[1],"dataType":1,"floatData":[1],"segment":{"begin":0}}},"modelSpec":{"name":"m"}}"#;
        let request = decode_request(body.as_bytes()).unwrap();
        assert_eq!(request.inputs[0].1.float_data, vec![1.0]);
    }

    #[test]
    fn test_decode_string_data() {
        let body = r#"{"inputs":{"S":{"dims":["2"],"dataType":8,"stringData":["aGVsbG8=","d29ybGQ="]}}}"#;
        let request = decode_request(body.as_bytes()).unwrap();
        assert_eq!(
            request.inputs[0].1.string_data,
            vec![b"hello".to_vec(), b"world".to_vec()]
        );
    }

    #[test]
    fn test_decode_url_safe_base64() {
        // 0xfb 0xff encodes to "-_8=" in the URL-safe alphabet
        let body = r#"{"inputs":{"X":{"dims":[2],"dataType":2,"rawData":"-_8="}}}"#;
        let request = decode_request(body.as_bytes()).unwrap();
        assert_eq!(request.inputs[0].1.raw_data, vec![0xfb, 0xff]);
    }

    #[test]
    fn test_decode_invalid_base64() {
        let body = r#"{"inputs":{"Input3":{"dims":["1","1","28","28"],"dataType":1,"rawData":"hello"}},"outputFilter":["Plus214_Output_0"]}"#;
        let err = decode_request(body.as_bytes()).unwrap_err();
        assert!(matches!(err, ServingError::InvalidArgument(_)));
        let message = err.to_string();
        assert!(message.starts_with("inputs.Input3.rawData: "), "{message}");
        assert!(message.contains("invalid base64"), "{message}");
        assert!(message.ends_with('^'), "{message}");
    }

    #[test]
    fn test_decode_invalid_json() {
        let body = r#"{inputs":{"Input3":{"dims":["1","1","28","28"],"dataType":1}}}"#;
        let err = decode_request(body.as_bytes()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("key must be a string"), "{message}");
        assert!(
            message.ends_with("{inputs\":{\"Input3\":{\"\n ^"),
            "{message}"
        );
    }

    #[test]
    fn test_decode_trailing_garbage() {
        let body = format!("{MNIST_REQUEST} extra");
        assert!(decode_request(body.as_bytes()).is_err());
    }

    #[test]
    fn test_decode_unknown_data_type_name() {
        let body = r#"{"inputs":{"X":{"dims":[1],"dataType":"FLOAT128"}}}"#;
        let err = decode_request(body.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("unknown data type"));
    }

    #[test]
    fn test_caret_snippet_window() {
        let line = "a".repeat(50);
        let snippet = caret_snippet(line.as_bytes(), 1, 30);
        let (text, caret) = snippet.split_once('\n').unwrap();
        assert_eq!(text.len(), 40);
        assert_eq!(caret, format!("{}^", " ".repeat(20)));
    }

    #[test]
    fn test_caret_snippet_multibyte() {
        let snippet = caret_snippet("{\"é\": x}".as_bytes(), 1, 8);
        assert!(snippet.ends_with('^'));
    }

    #[test]
    fn test_encode_response() {
        let mut response = PredictResponse::default();
        response.outputs.insert(
            "Plus214_Output_0".to_string(),
            TensorProto {
                dims: vec![1, 2],
                data_type: DataType::Float as i32,
                raw_data: [1.0f32, 2.0]
                    .iter()
                    .flat_map(|v| v.to_le_bytes())
                    .collect(),
                ..Default::default()
            },
        );

        let body = String::from_utf8(encode_response(&response).unwrap()).unwrap();
        assert_eq!(
            body,
            r#"{"outputs":{"Plus214_Output_0":{"dims":["1","2"],"dataType":1,"rawData":"AACAPwAAAEA="}}}"#
        );
    }

    #[test]
    fn test_encode_response_sorted_and_typed() {
        let mut response = PredictResponse::default();
        for name in ["b", "a"] {
            response.outputs.insert(
                name.to_string(),
                TensorProto {
                    dims: vec![2],
                    data_type: DataType::Float as i32,
                    float_data: vec![0.5, f32::NAN],
                    ..Default::default()
                },
            );
        }

        let body = String::from_utf8(encode_response(&response).unwrap()).unwrap();
        assert_eq!(
            body,
            r#"{"outputs":{"a":{"dims":["2"],"dataType":1,"floatData":[0.5,"NaN"]},"b":{"dims":["2"],"dataType":1,"floatData":[0.5,"NaN"]}}}"#
        );

        let decoded = decode_response(body.as_bytes()).unwrap();
        assert_eq!(decoded.outputs.len(), 2);
        assert!(decoded.outputs["a"].float_data[1].is_nan());
    }

    #[test]
    fn test_encode_empty_response() {
        let body = encode_response(&PredictResponse::default()).unwrap();
        assert_eq!(body, b"{}");
    }

    #[test]
    fn test_escape() {
        assert_eq!(
            escape("This is an error message \" \n "),
            "This is an error message \\\" \\n "
        );
        assert_eq!(escape("\u{1f}"), "\\u001f");
        assert_eq!(escape("a\0b"), "ab");
        assert_eq!(escape("tab\there\\"), "tab\\there\\\\");
        assert_eq!(escape("ünïcödé"), "ünïcödé");
    }

    #[test]
    fn test_encode_error() {
        assert_eq!(
            encode_error(StatusCode::BAD_REQUEST, "Hello"),
            "{\"error_code\": 400, \"error_message\": \"Hello\"}\n"
        );

        let body = encode_error(StatusCode::INTERNAL_SERVER_ERROR, "line \"one\"\nline two");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["error_code"], 500);
        assert_eq!(parsed["error_message"], "line \"one\"\nline two");
    }
}
