//! Builds the JSON form of a request message from the parts of an HTTP
//! request.

use serde_json::{Map, Value};

use crate::gateway::error::HttpError;
use crate::gateway::route::{BodyMapping, GatewayRoute};

/// Populate the request object: the body first, then path variables, then
/// query parameters. Later sources overwrite earlier ones.
pub(crate) fn build_request(
    route: &GatewayRoute,
    captures: Vec<(String, String)>,
    query: Option<&str>,
    body: &[u8],
) -> Result<Value, HttpError> {
    let mut request = body_value(route.body_mapping(), body)?;

    for (variable, raw) in captures {
        let value = route
            .path_kind(&variable)
            .convert(&raw)
            .map_err(|reason| HttpError::bad_request(format!("path variable '{variable}': {reason}")))?;
        set_field(&mut request, &variable, value)?;
    }

    if let Some(query) = query {
        for (name, raw) in url::form_urlencoded::parse(query.as_bytes()) {
            let binding = route.query_binding(&name).ok_or_else(|| {
                HttpError::bad_request(format!("unknown query parameter '{name}'"))
            })?;
            let value = binding
                .kind
                .convert(&raw)
                .map_err(|reason| HttpError::bad_request(format!("query parameter '{name}': {reason}")))?;
            set_field(&mut request, &binding.field, value)?;
        }
    }

    Ok(request)
}

fn body_value(mapping: &BodyMapping, body: &[u8]) -> Result<Value, HttpError> {
    let empty = body.iter().all(u8::is_ascii_whitespace);
    let parse = || {
        serde_json::from_slice::<Value>(body)
            .map_err(|err| HttpError::bad_request(format!("request body is not valid JSON: {err}")))
    };

    match mapping {
        BodyMapping::None if empty => Ok(Value::Object(Map::new())),
        BodyMapping::None => Err(HttpError::bad_request("this route does not accept a request body")),
        BodyMapping::Whole if empty => Ok(Value::Object(Map::new())),
        BodyMapping::Whole => match parse()? {
            object @ Value::Object(_) => Ok(object),
            _ => Err(HttpError::bad_request("request body must be a JSON object")),
        },
        BodyMapping::Field(_) if empty => Ok(Value::Object(Map::new())),
        BodyMapping::Field(field) => {
            let mut request = Value::Object(Map::new());
            set_field(&mut request, field, parse()?)?;
            Ok(request)
        }
    }
}

/// Store `value` at the dotted `path`, creating intermediate objects.
pub(crate) fn set_field(root: &mut Value, path: &str, value: Value) -> Result<(), HttpError> {
    let conflict = || HttpError::bad_request(format!("field '{path}' conflicts with another value"));

    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, path),
    };

    let mut current = root;
    for part in parents.into_iter().flat_map(|parents| parents.split('.')) {
        let Value::Object(object) = current else {
            return Err(conflict());
        };
        current = object
            .entry(part)
            .or_insert_with(|| Value::Object(Map::new()));
    }

    let Value::Object(object) = current else {
        return Err(conflict());
    };
    object.insert(leaf.to_owned(), value);
    Ok(())
}
