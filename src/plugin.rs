//! Plugin registration and the invocation surface.
//!
//! A [`Plugin`] is a namespace of named functions, each declaring its
//! argument shape with a compact signature string:
//!
//! ```text
//! name:type[:opt][:empty];...
//! ```
//!
//! where `type` is one of `int`, `float`, `data`, `vnode`, `anode`,
//! `vframe`, `aframe`, `func`, optionally suffixed `[]` for arrays.
//! `:opt` marks an argument optional and `:empty` permits explicit empty
//! arrays. [`Plugin::invoke`] validates an argument map against the
//! signature before calling the function; all failures surface as the
//! error string of the returned map.

use crate::core::Core;
use crate::error::{Error, Result};
use crate::map::{Map, ValueType};
use std::collections::HashMap;
use std::sync::Mutex;

/// Argument value type named in a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Byte string.
    Data,
    /// Video node.
    VideoNode,
    /// Audio node.
    AudioNode,
    /// Video frame.
    VideoFrame,
    /// Audio frame.
    AudioFrame,
    /// Function reference.
    Function,
}

impl ArgType {
    fn accepts(self, stored: ValueType) -> bool {
        matches!(
            (self, stored),
            (ArgType::Int, ValueType::Int)
                | (ArgType::Float, ValueType::Float)
                | (ArgType::Data, ValueType::Data)
                | (ArgType::VideoNode, ValueType::VideoNode)
                | (ArgType::AudioNode, ValueType::AudioNode)
                | (ArgType::VideoFrame, ValueType::VideoFrame)
                | (ArgType::AudioFrame, ValueType::AudioFrame)
                | (ArgType::Function, ValueType::Function)
        )
    }

    fn parse(token: &str) -> Option<ArgType> {
        Some(match token {
            "int" => ArgType::Int,
            "float" => ArgType::Float,
            "data" => ArgType::Data,
            "vnode" => ArgType::VideoNode,
            "anode" => ArgType::AudioNode,
            "vframe" => ArgType::VideoFrame,
            "aframe" => ArgType::AudioFrame,
            "func" => ArgType::Function,
            _ => return None,
        })
    }
}

/// One argument slot parsed out of a signature string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    /// Argument name.
    pub name: String,
    /// Expected value type.
    pub kind: ArgType,
    /// Whether more than one element is allowed.
    pub array: bool,
    /// Whether the argument may be absent.
    pub optional: bool,
    /// Whether an explicitly empty array is accepted.
    pub allow_empty: bool,
}

/// Parse a `name:type[:opt][:empty];...` signature string.
pub fn parse_signature(signature: &str) -> Result<Vec<ArgSpec>> {
    let mut specs: Vec<ArgSpec> = Vec::new();
    for item in signature.split(';').filter(|s| !s.is_empty()) {
        let mut parts = item.split(':');
        let name = parts
            .next()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidArgument(format!("empty argument name in {item:?}")))?;
        let type_token = parts
            .next()
            .ok_or_else(|| Error::InvalidArgument(format!("missing type for argument {name:?}")))?;
        let (base, array) = match type_token.strip_suffix("[]") {
            Some(base) => (base, true),
            None => (type_token, false),
        };
        let kind = ArgType::parse(base).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown argument type {type_token:?}"))
        })?;

        let mut optional = false;
        let mut allow_empty = false;
        for modifier in parts {
            match modifier {
                "opt" => optional = true,
                "empty" => allow_empty = true,
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown argument modifier {other:?}"
                    )))
                }
            }
        }
        if allow_empty && !array {
            return Err(Error::InvalidArgument(format!(
                "scalar argument {name:?} cannot allow empty arrays"
            )));
        }
        if specs.iter().any(|s| s.name == name) {
            return Err(Error::InvalidArgument(format!(
                "duplicate argument name {name:?}"
            )));
        }
        specs.push(ArgSpec {
            name: name.to_string(),
            kind,
            array,
            optional,
            allow_empty,
        });
    }
    Ok(specs)
}

fn validate_args(specs: &[ArgSpec], args: &Map) -> std::result::Result<(), String> {
    for spec in specs {
        let count = match args.num_elements(&spec.name) {
            None => {
                if spec.optional {
                    continue;
                }
                return Err(format!("missing required argument {:?}", spec.name));
            }
            Some(count) => count,
        };
        if count == 0 && !spec.allow_empty {
            return Err(format!("argument {:?} does not accept empty arrays", spec.name));
        }
        if count > 1 && !spec.array {
            return Err(format!("argument {:?} is not an array", spec.name));
        }
        if count > 0 {
            let stored = args.value_type(&spec.name);
            if !spec.kind.accepts(stored) {
                return Err(format!(
                    "argument {:?} has wrong type {:?}",
                    spec.name, stored
                ));
            }
        }
    }
    for index in 0..args.len() {
        let key = args.key(index).expect("index in range");
        if !specs.iter().any(|s| s.name == key) {
            return Err(format!("does not accept argument {key:?}"));
        }
    }
    Ok(())
}

type PublicFn = Box<dyn Fn(&Map, &mut Map, &Core) + Send + Sync>;

struct PluginFunction {
    signature: Vec<ArgSpec>,
    func: PublicFn,
}

/// A namespace of invokable functions.
pub struct Plugin {
    namespace: String,
    name: String,
    functions: Mutex<HashMap<String, PluginFunction>>,
}

impl Plugin {
    /// Create an empty plugin.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            functions: Mutex::new(HashMap::new()),
        }
    }

    /// The plugin's namespace (the invocation handle).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The plugin's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a function with its argument signature.
    pub fn register_function(
        &self,
        name: impl Into<String>,
        signature: &str,
        func: impl Fn(&Map, &mut Map, &Core) + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        let signature = parse_signature(signature)?;
        let mut functions = self.functions.lock().unwrap();
        if functions.contains_key(&name) {
            return Err(Error::InvalidArgument(format!(
                "function {name:?} already registered in {:?}",
                self.namespace
            )));
        }
        functions.insert(
            name,
            PluginFunction {
                signature,
                func: Box::new(func),
            },
        );
        Ok(())
    }

    /// Names of all registered functions, sorted.
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Validate `args` against the named function's signature and call
    /// it. Failures are reported via the returned map's error string.
    pub fn invoke(&self, name: &str, args: &Map, core: &Core) -> Map {
        let mut out = Map::new();
        let functions = self.functions.lock().unwrap();
        let Some(function) = functions.get(name) else {
            out.set_error(format!(
                "no function named {name:?} in plugin {:?}",
                self.namespace
            ));
            return out;
        };
        if let Err(message) = validate_args(&function.signature, args) {
            out.set_error(format!("{name}: {message}"));
            return out;
        }
        (function.func)(args, &mut out, core);
        out
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("namespace", &self.namespace)
            .field("name", &self.name)
            .field("functions", &self.function_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::AppendMode;

    #[test]
    fn test_parse_signature() {
        let specs =
            parse_signature("clip:anode;first:int:opt;gain:float[]:opt;names:data[]:opt:empty;")
                .unwrap();
        assert_eq!(specs.len(), 4);
        assert_eq!(specs[0].kind, ArgType::AudioNode);
        assert!(!specs[0].optional);
        assert!(specs[2].array && specs[2].optional);
        assert!(specs[3].allow_empty);
    }

    #[test]
    fn test_parse_signature_rejects_garbage() {
        assert!(parse_signature("clip:vnode:wat;").is_err());
        assert!(parse_signature("clip:nodey;").is_err());
        assert!(parse_signature(":int;").is_err());
        assert!(parse_signature("a:int;a:int;").is_err());
        assert!(parse_signature("n:int:empty;").is_err());
    }

    #[test]
    fn test_invoke_validation() {
        let core = Core::new(1);
        let plugin = Plugin::new("test", "Test plugin");
        plugin
            .register_function("Sum", "values:int[];scale:int:opt;", |args, out, _core| {
                let values = args.get_ints("values").unwrap();
                let scale = args.get_int_opt("scale", 0).unwrap().unwrap_or(1);
                let sum: i64 = values.iter().sum();
                out.set_int("sum", sum * scale, AppendMode::Replace).unwrap();
            })
            .unwrap();

        let mut args = Map::new();
        args.set_int_array("values", &[1, 2, 3]).unwrap();
        let out = plugin.invoke("Sum", &args, &core);
        assert_eq!(out.error(), None);
        assert_eq!(out.get_int("sum", 0), Ok(6));

        // Missing required argument.
        let out = plugin.invoke("Sum", &Map::new(), &core);
        assert!(out.error().unwrap().contains("values"));

        // Wrong type.
        let mut args = Map::new();
        args.set_float("values", 1.0, AppendMode::Replace).unwrap();
        let out = plugin.invoke("Sum", &args, &core);
        assert!(out.error().unwrap().contains("wrong type"));

        // Unknown argument.
        let mut args = Map::new();
        args.set_int_array("values", &[1]).unwrap();
        args.set_int("bogus", 1, AppendMode::Replace).unwrap();
        let out = plugin.invoke("Sum", &args, &core);
        assert!(out.error().unwrap().contains("bogus"));

        // Scalar passed an array.
        let mut args = Map::new();
        args.set_int_array("values", &[1]).unwrap();
        args.set_int_array("scale", &[1, 2]).unwrap();
        let out = plugin.invoke("Sum", &args, &core);
        assert!(out.error().unwrap().contains("not an array"));

        // Unknown function.
        let out = plugin.invoke("Nope", &Map::new(), &core);
        assert!(out.error().unwrap().contains("Nope"));
    }
}
