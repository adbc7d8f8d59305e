use percent_encoding::percent_decode_str;
use std::fmt;

use crate::gateway::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `{field.path}`
    Variable(String),
}

/// A URL path template such as `/v1/packages/{id}`.
///
/// Each `{name}` segment captures one percent-decoded path segment into the
/// request field `name`, which may be a dotted path into nested messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    pub fn parse(template: &str) -> Result<Self, GatewayError> {
        let invalid = |reason: &str| GatewayError::InvalidTemplate {
            template: template.to_owned(),
            reason: reason.to_owned(),
        };

        let rest = template
            .strip_prefix('/')
            .ok_or_else(|| invalid("must start with '/'"))?;

        let mut segments = Vec::new();
        if !rest.is_empty() {
            for segment in rest.split('/') {
                if segment.is_empty() {
                    return Err(invalid("empty path segment"));
                }
                match segment.strip_prefix('{') {
                    Some(inner) => {
                        let name = inner
                            .strip_suffix('}')
                            .ok_or_else(|| invalid("unterminated variable"))?;
                        if !is_field_path(name) {
                            return Err(invalid(&format!("invalid variable name '{name}'")));
                        }
                        if segments.contains(&Segment::Variable(name.to_owned())) {
                            return Err(invalid(&format!("variable '{name}' appears twice")));
                        }
                        segments.push(Segment::Variable(name.to_owned()));
                    }
                    None if segment.contains(['{', '}']) => {
                        return Err(invalid("variables must span a whole segment"));
                    }
                    None => segments.push(Segment::Literal(segment.to_owned())),
                }
            }
        }

        Ok(Self {
            raw: template.to_owned(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Variable names in template order.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Variable(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables().any(|variable| variable == name)
    }

    /// Match a request path, returning the decoded value of every variable.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let rest = path.strip_prefix('/')?;
        let parts: Vec<&str> = if rest.is_empty() {
            Vec::new()
        } else {
            rest.split('/').collect()
        };
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut captures = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            let decoded = percent_decode_str(part).decode_utf8().ok()?;
            match segment {
                Segment::Literal(literal) if *literal == decoded => {}
                Segment::Literal(_) => return None,
                Segment::Variable(_) if decoded.is_empty() => return None,
                Segment::Variable(name) => captures.push((name.clone(), decoded.into_owned())),
            }
        }
        Some(captures)
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// `name` or `outer.inner`, each part an identifier.
pub(crate) fn is_field_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
