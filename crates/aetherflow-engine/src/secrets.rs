//! Secrets hook contract.
//!
//! Two interception points, both invoked only during resource resolution:
//! `expand_env` may enrich a copy of the env snapshot before template
//! rendering, and `decode` transforms decode-marked leaf values after
//! rendering. The embedder installs a hook on the engine; flows that mark
//! fields for decode fail resource resolution when no hook is present.

use std::collections::BTreeMap;

use aetherflow_types::error::Result;

/// Hook invoked at the documented resource-resolution points.
pub trait SecretsHook: Send + Sync {
    /// Return a (possibly enriched) env mapping used for subsequent env
    /// lookups. Must not mutate shared state.
    ///
    /// # Errors
    ///
    /// A failure aborts the run before any job executes.
    fn expand_env(&self, env: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
        Ok(env.clone())
    }

    /// Decode one rendered leaf value.
    ///
    /// # Errors
    ///
    /// A failure aborts the run before any job executes.
    fn decode(&self, value: &str) -> Result<String>;
}

/// Hook that passes env through untouched and decodes to the identity.
/// Useful for flows whose decode markers are handled out-of-band in dev.
pub struct IdentitySecrets;

impl SecretsHook for IdentitySecrets {
    fn decode(&self, value: &str) -> Result<String> {
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hook_roundtrips() {
        let hook = IdentitySecrets;
        let env = BTreeMap::from([("K".to_string(), "v".to_string())]);
        assert_eq!(hook.expand_env(&env).unwrap(), env);
        assert_eq!(hook.decode("cipher").unwrap(), "cipher");
    }

    #[test]
    fn hook_is_object_safe() {
        fn _assert(_: &dyn SecretsHook) {}
    }
}
