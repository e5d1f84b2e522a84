//! Metabase Module for native API descriptions
//!
//! The metabase is produced upstream by header introspection and consumed
//! read-only. Collections are ordered maps so every walk over them is
//! deterministic.

use crate::error::CompileResult;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Superclass chains longer than this are treated as malformed.
const MAX_SUPERCLASS_DEPTH: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metabase {
    #[serde(default)]
    pub classes: BTreeMap<String, ClassDef>,
    #[serde(default)]
    pub types: BTreeMap<String, TypeDef>,
    #[serde(default)]
    pub functions: BTreeMap<String, FunctionDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClassDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub superclass: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default, deserialize_with = "method_table")]
    pub methods: BTreeMap<String, Vec<MethodDef>>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MethodDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub selector: Option<String>,
    #[serde(default = "default_true")]
    pub instance: bool,
    #[serde(default = "default_void")]
    pub return_type: String,
    #[serde(default)]
    pub args: Vec<ArgDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ArgDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PropertyDef {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default = "default_true")]
    pub instance: bool,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub attributes: Vec<String>,
}

impl PropertyDef {
    pub fn is_readonly(&self) -> bool {
        self.readonly || self.attributes.iter().any(|a| a == "readonly")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TypeDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub ty: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub metatype: Option<String>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub import: Option<String>,
    #[serde(default)]
    pub vector: Option<serde_json::Value>,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
    /// Enum members keyed by member name.
    #[serde(default)]
    pub types: BTreeMap<String, EnumMember>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnumMember {
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDef {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_void")]
    pub return_type: String,
    #[serde(default, alias = "args")]
    pub arguments: Vec<ArgDef>,
}

fn default_true() -> bool {
    true
}

fn default_void() -> String {
    "void".to_string()
}

/// Accepts `name -> method` and `name -> [method, ...]` tables.
fn method_table<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<MethodDef>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(MethodDef),
        Many(Vec<MethodDef>),
    }

    let raw: BTreeMap<String, OneOrMany> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(name, entry)| {
            let mut defs = match entry {
                OneOrMany::One(def) => vec![def],
                OneOrMany::Many(defs) => defs,
            };
            for def in defs.iter_mut() {
                if def.name.is_empty() {
                    def.name = name.clone();
                }
            }
            (name, defs)
        })
        .collect())
}

impl Metabase {
    pub fn from_json(json: &str) -> CompileResult<Self> {
        let mut metabase: Metabase = serde_json::from_str(json)?;
        metabase.fill_names();
        Ok(metabase)
    }

    pub fn load(path: &Path) -> CompileResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    fn fill_names(&mut self) {
        for (name, class) in self.classes.iter_mut() {
            for (prop_name, prop) in class.properties.iter_mut() {
                if prop.name.is_empty() {
                    prop.name = prop_name.clone();
                }
            }
            if class.name.is_none() {
                class.name = Some(name.clone());
            }
        }
        for (name, func) in self.functions.iter_mut() {
            if func.name.is_empty() {
                func.name = name.clone();
            }
        }
    }

    pub fn class(&self, name: &str) -> Option<&ClassDef> {
        self.classes.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDef> {
        self.functions.get(name)
    }

    /// True when `name` is a class, function or type the metabase describes.
    pub fn is_valid_symbol(&self, name: &str) -> bool {
        self.classes.contains_key(name)
            || self.functions.contains_key(name)
            || self.types.contains_key(name)
    }

    /// The class followed by its superclasses, nearest first.
    pub fn class_chain(&self, name: &str) -> Vec<&ClassDef> {
        let mut chain = Vec::new();
        let mut current = self.classes.get(name);
        while let Some(class) = current {
            chain.push(class);
            if chain.len() >= MAX_SUPERCLASS_DEPTH {
                break;
            }
            current = class
                .superclass
                .as_deref()
                .and_then(|sup| self.classes.get(sup));
        }
        chain
    }

    /// Property lookup walking the superclass chain; struct and union
    /// fields answer as read-write instance properties.
    pub fn find_property(&self, class_name: &str, property: &str) -> Option<PropertyDef> {
        for class in self.class_chain(class_name) {
            if let Some(prop) = class.properties.get(property) {
                return Some(prop.clone());
            }
        }
        let def = self.types.get(class_name)?;
        let field = def.fields.iter().find(|f| f.name == property)?;
        Some(PropertyDef {
            name: field.name.clone(),
            ty: field.ty.clone(),
            subtype: None,
            instance: true,
            readonly: false,
            attributes: vec![],
        })
    }

    pub fn find_methods(&self, class_name: &str, method: &str) -> Option<&[MethodDef]> {
        self.class_chain(class_name)
            .into_iter()
            .find_map(|class| class.methods.get(method))
            .map(|defs| defs.as_slice())
    }

    /// Picks the overload matching the call's argument count, else the first.
    pub fn find_method(&self, class_name: &str, method: &str, argc: usize) -> Option<MethodDef> {
        let defs = self.find_methods(class_name, method)?;
        defs.iter()
            .find(|m| m.args.len() == argc)
            .or_else(|| defs.first())
            .cloned()
    }

    /// Numeric value of an enum member, looked up through the enum's type entry.
    pub fn enum_value(&self, enum_type: &str, member: &str) -> Option<String> {
        let key = enum_type.trim_start_matches("enum ").trim();
        let def = self.types.get(key)?;
        match &def.types.get(member)?.value {
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            _ => None,
        }
    }
}
