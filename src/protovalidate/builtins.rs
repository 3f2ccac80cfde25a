//! Protovalidate extension functions for the CEL checker.
//!
//! See: https://buf.build/docs/protovalidate/

use cel_core::types::{FunctionDecl, OverloadDecl};
use cel_core::{CelType, Env};

/// Receiver-style methods, each with its accepted parameter lists (receiver first).
fn method_table() -> Vec<(&'static str, Vec<Vec<CelType>>)> {
    use CelType::{Bool, Double, Int, String};

    vec![
        ("isEmail", vec![vec![String]]),
        ("isHostname", vec![vec![String]]),
        ("isIp", vec![vec![String], vec![String, Int]]),
        (
            "isIpPrefix",
            vec![vec![String], vec![String, Int], vec![String, Int, Bool]],
        ),
        ("isUri", vec![vec![String]]),
        ("isUriRef", vec![vec![String]]),
        ("unique", vec![vec![CelType::list(CelType::Dyn)]]),
        ("isNan", vec![vec![Double]]),
        ("isInf", vec![vec![Double], vec![Double, Int]]),
    ]
}

fn overload_suffix(param: &CelType) -> &'static str {
    match param {
        CelType::String => "string",
        CelType::Int => "int",
        CelType::Bool => "bool",
        CelType::Double => "double",
        _ => "list",
    }
}

/// Declarations of every protovalidate method, all returning `bool`.
pub fn protovalidate_functions() -> Vec<FunctionDecl> {
    method_table()
        .into_iter()
        .map(|(name, signatures)| {
            signatures
                .into_iter()
                .fold(FunctionDecl::new(name), |decl, params| {
                    let id = std::iter::once(name)
                        .chain(params.iter().map(overload_suffix))
                        .collect::<Vec<_>>()
                        .join("_");
                    decl.with_overload(OverloadDecl::method(id.as_str(), params, CelType::Bool))
                })
        })
        .collect()
}

/// Standard library, all extensions, the protovalidate methods and the
/// variables protovalidate binds (`this`, `rules`, `now`).
pub fn protovalidate_env() -> Env {
    Env::with_standard_library()
        .with_all_extensions()
        .with_extension(protovalidate_functions())
        .with_variable("this", CelType::Dyn)
        .with_variable("rules", CelType::Dyn)
        .with_variable("now", CelType::Timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_method_is_declared() {
        let names: Vec<_> = protovalidate_functions()
            .iter()
            .map(|f| f.name.clone())
            .collect();
        assert_eq!(
            names,
            vec![
                "isEmail",
                "isHostname",
                "isIp",
                "isIpPrefix",
                "isUri",
                "isUriRef",
                "unique",
                "isNan",
                "isInf",
            ]
        );
    }

    #[test]
    fn env_binds_protovalidate_variables() {
        let env = protovalidate_env();
        assert_eq!(env.variables().get("this"), Some(&CelType::Dyn));
        assert_eq!(env.variables().get("rules"), Some(&CelType::Dyn));
        assert_eq!(env.variables().get("now"), Some(&CelType::Timestamp));
        assert!(env.functions().contains_key("isEmail"));
        assert!(env.functions().contains_key("unique"));
        assert!(env.functions().contains_key("size"));
    }
}
