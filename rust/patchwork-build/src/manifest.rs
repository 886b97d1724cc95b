//! Module manifests: the registration entry point of a boilerplate module.
//!
//! A manifest names the module and declares each family's axes, the
//! symbol template its specialized bodies follow, and the constraints that
//! rule tuples out. Loading a manifest validates it fully and resolves every
//! name into encoded axis values, so enumeration never sees a string.
//!
//! ```toml
//! module = "arith"
//!
//! [[family]]
//! name = "add"
//! body = "add_{lhs}_{op}"
//! axes = [
//!   { name = "lhs", kind = "type", values = ["u8", "u64"] },
//!   { name = "op", kind = "enum", variants = ["add", "sub"] },
//! ]
//! exclude = [ { lhs = ["u8"], op = ["sub"] } ]
//! ```

use std::collections::{BTreeMap, HashSet};

use patchwork_core::{validate_axes, AxisKind, ParameterAxis, Predicate, TypeId};
use serde::{Deserialize, Serialize};

use crate::error::BuildError;

// ---------------------------------------------------------------------------
// Raw TOML shape
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    module: String,
    #[serde(default, rename = "family")]
    families: Vec<RawFamily>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFamily {
    name: String,
    body: String,
    #[serde(default)]
    axes: Vec<RawAxis>,
    #[serde(default)]
    exclude: Vec<BTreeMap<String, Vec<RawValue>>>,
    #[serde(default)]
    same: Vec<[String; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum RawAxis {
    Type {
        name: String,
        #[serde(default)]
        values: Option<Vec<String>>,
    },
    Bool {
        name: String,
    },
    Enum {
        name: String,
        #[serde(default)]
        count: Option<u64>,
        #[serde(default)]
        variants: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawValue {
    Bool(bool),
    Int(u64),
    Name(String),
}

impl std::fmt::Display for RawValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Name(s) => write!(f, "\"{s}\""),
        }
    }
}

// ---------------------------------------------------------------------------
// Validated model
// ---------------------------------------------------------------------------

/// Name and value vocabulary of one axis, carried through to code generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisSignature {
    pub name: String,
    pub kind: AxisKind,
    /// Variant names of a named enum axis; empty for numeric enums.
    #[serde(default)]
    pub variants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BodySegment {
    Literal(String),
    Axis(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Constraint {
    /// Reject tuples whose value on every listed axis is one of the listed
    /// values.
    Exclude(Vec<(usize, Vec<u64>)>),
    /// Reject tuples whose two axes differ.
    Same(usize, usize),
}

/// The manifest's constraint list as an enumeration predicate.
///
/// A constraint is only checked once every axis it mentions is inside the
/// prefix, so rejections prune as early as the constraint allows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    constraints: Vec<Constraint>,
}

impl Predicate for Constraints {
    fn accepts(&self, prefix: &[u64]) -> bool {
        self.constraints.iter().all(|c| match c {
            Constraint::Exclude(pattern) => {
                let decided = pattern.iter().all(|(axis, _)| *axis < prefix.len());
                !(decided
                    && pattern
                        .iter()
                        .all(|(axis, values)| values.contains(&prefix[*axis])))
            }
            Constraint::Same(a, b) => {
                (*a).max(*b) >= prefix.len() || prefix[*a] == prefix[*b]
            }
        })
    }
}

/// A validated family declaration.
#[derive(Debug, Clone)]
pub struct FamilyDecl {
    pub name: String,
    pub axes: Vec<ParameterAxis>,
    pub signature: Vec<AxisSignature>,
    pub constraints: Constraints,
    body: Vec<BodySegment>,
}

impl FamilyDecl {
    /// Render the body symbol for a full tuple.
    pub fn body_symbol(&self, tuple: &[u64]) -> String {
        let mut out = String::new();
        for segment in &self.body {
            match segment {
                BodySegment::Literal(text) => out.push_str(text),
                BodySegment::Axis(axis) => {
                    out.push_str(&self.value_symbol(*axis, tuple[*axis]))
                }
            }
        }
        out
    }

    fn value_symbol(&self, axis: usize, value: u64) -> String {
        match &self.axes[axis] {
            ParameterAxis::Type(_) => TypeId::decode(value)
                .map(TypeId::symbol_name)
                .unwrap_or_else(|| format!("type{value}")),
            ParameterAxis::Bool => (value != 0).to_string(),
            ParameterAxis::Enum { .. } => self.signature[axis]
                .variants
                .get(value as usize)
                .cloned()
                .unwrap_or_else(|| value.to_string()),
        }
    }

    pub fn axis_kinds(&self) -> Vec<AxisKind> {
        self.axes.iter().map(ParameterAxis::kind).collect()
    }
}

/// A validated module manifest.
#[derive(Debug, Clone)]
pub struct ModuleManifest {
    pub module: String,
    pub families: Vec<FamilyDecl>,
}

impl ModuleManifest {
    /// Parse and validate manifest text. `origin` names the file in errors.
    pub fn parse(origin: &str, text: &str) -> Result<Self, BuildError> {
        let raw: RawManifest = toml::from_str(text).map_err(|e| BuildError::MalformedModule {
            module: origin.to_string(),
            reason: e.to_string(),
        })?;
        let bad = |reason: String| BuildError::MalformedModule {
            module: raw.module.clone(),
            reason,
        };

        check_identifier(&raw.module).map_err(|r| bad(format!("module name: {r}")))?;

        let mut seen = HashSet::new();
        let mut families = Vec::with_capacity(raw.families.len());
        for family in &raw.families {
            if !seen.insert(family.name.as_str()) {
                return Err(bad(format!("family `{}` declared twice", family.name)));
            }
            families.push(
                resolve_family(family)
                    .map_err(|r| bad(format!("family `{}`: {r}", family.name)))?,
            );
        }
        Ok(Self {
            module: raw.module,
            families,
        })
    }
}

fn resolve_family(raw: &RawFamily) -> Result<FamilyDecl, String> {
    check_identifier(&raw.name)?;

    let mut axes = Vec::with_capacity(raw.axes.len());
    let mut signature = Vec::with_capacity(raw.axes.len());
    for axis in &raw.axes {
        let (axis, sig) = resolve_axis(axis)?;
        if signature.iter().any(|s: &AxisSignature| s.name == sig.name) {
            return Err(format!("axis `{}` declared twice", sig.name));
        }
        axes.push(axis);
        signature.push(sig);
    }
    validate_axes(&axes).map_err(|e| e.to_string())?;

    let position = |name: &str| {
        signature
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| format!("unknown axis `{name}`"))
    };

    let mut constraints = Vec::new();
    for pattern in &raw.exclude {
        if pattern.is_empty() {
            return Err("empty exclude pattern".to_string());
        }
        let mut resolved = Vec::with_capacity(pattern.len());
        for (name, values) in pattern {
            let axis = position(name)?;
            let encoded = values
                .iter()
                .map(|v| encode_value(&axes[axis], &signature[axis], v))
                .collect::<Result<Vec<_>, _>>()?;
            resolved.push((axis, encoded));
        }
        constraints.push(Constraint::Exclude(resolved));
    }
    for [a, b] in &raw.same {
        let (a, b) = (position(a)?, position(b)?);
        if axes[a].kind() != axes[b].kind() {
            return Err(format!(
                "`same` pairs axes of different kinds: `{}` and `{}`",
                signature[a].name, signature[b].name
            ));
        }
        constraints.push(Constraint::Same(a, b));
    }

    let body = parse_body(&raw.body, &signature)?;

    Ok(FamilyDecl {
        name: raw.name.clone(),
        axes,
        signature,
        constraints: Constraints { constraints },
        body,
    })
}

fn resolve_axis(raw: &RawAxis) -> Result<(ParameterAxis, AxisSignature), String> {
    let (name, axis, variants) = match raw {
        RawAxis::Type { name, values } => {
            let domain = match values {
                Some(values) => values
                    .iter()
                    .map(|v| v.parse::<TypeId>().map_err(|e| e.to_string()))
                    .collect::<Result<Vec<_>, _>>()?,
                None => TypeId::all().collect(),
            };
            if domain.is_empty() {
                return Err(format!("type axis `{name}` has no values"));
            }
            (name, ParameterAxis::Type(domain), Vec::new())
        }
        RawAxis::Bool { name } => (name, ParameterAxis::Bool, Vec::new()),
        RawAxis::Enum {
            name,
            count,
            variants,
        } => {
            for v in variants {
                check_identifier(v).map_err(|r| format!("axis `{name}` variant: {r}"))?;
            }
            if let Some(dup) = variants
                .iter()
                .enumerate()
                .find(|(i, v)| variants[..*i].contains(v))
            {
                return Err(format!("axis `{name}` lists variant `{}` twice", dup.1));
            }
            let count = match (count, variants.len()) {
                (Some(c), 0) => *c,
                (None, n) if n > 0 => n as u64,
                (Some(c), n) if *c == n as u64 => *c,
                (Some(c), n) => {
                    return Err(format!(
                        "axis `{name}`: count = {c} but {n} variants are listed"
                    ))
                }
                (None, _) => return Err(format!("axis `{name}` needs `count` or `variants`")),
            };
            if count == 0 {
                return Err(format!("axis `{name}` is empty"));
            }
            (name, ParameterAxis::Enum { count }, variants.clone())
        }
    };
    check_identifier(name).map_err(|r| format!("axis name: {r}"))?;
    let signature = AxisSignature {
        name: name.clone(),
        kind: axis.kind(),
        variants,
    };
    Ok((axis, signature))
}

fn encode_value(
    axis: &ParameterAxis,
    signature: &AxisSignature,
    value: &RawValue,
) -> Result<u64, String> {
    let reject = || format!("value {value} is not in the domain of axis `{}`", signature.name);
    match (axis, value) {
        (ParameterAxis::Type(domain), RawValue::Name(name)) => {
            let ty = name.parse::<TypeId>().map_err(|e| e.to_string())?;
            if domain.contains(&ty) {
                Ok(ty.encode())
            } else {
                Err(reject())
            }
        }
        (ParameterAxis::Bool, RawValue::Bool(b)) => Ok(u64::from(*b)),
        (ParameterAxis::Enum { count }, RawValue::Int(n)) if n < count => Ok(*n),
        (ParameterAxis::Enum { .. }, RawValue::Name(name)) => signature
            .variants
            .iter()
            .position(|v| v == name)
            .map(|i| i as u64)
            .ok_or_else(reject),
        _ => Err(reject()),
    }
}

fn parse_body(template: &str, signature: &[AxisSignature]) -> Result<Vec<BodySegment>, String> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        if open > 0 {
            segments.push(BodySegment::Literal(rest[..open].to_string()));
        }
        let close = rest[open..]
            .find('}')
            .ok_or_else(|| format!("unterminated `{{` in body `{template}`"))?;
        let name = &rest[open + 1..open + close];
        let axis = signature
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| format!("body `{template}` names unknown axis `{name}`"))?;
        segments.push(BodySegment::Axis(axis));
        rest = &rest[open + close + 1..];
    }
    if rest.contains('}') {
        return Err(format!("stray `}}` in body `{template}`"));
    }
    if !rest.is_empty() {
        segments.push(BodySegment::Literal(rest.to_string()));
    }
    if segments.is_empty() {
        return Err("empty body template".to_string());
    }
    Ok(segments)
}

/// Names flow into generated Rust identifiers and cache file names.
fn check_identifier(name: &str) -> Result<(), String> {
    let mut chars = name.chars();
    let valid = name != "_"
        && matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(format!("`{name}` is not a lowercase identifier"))
    }
}
