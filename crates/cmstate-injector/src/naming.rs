//! Deterministic names for group records and their members

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use cmstate_common::STATE_NAME_PREFIX;

/// CMState name for a template.
///
/// Every pod that opts into the same template in a namespace converges on
/// this name; the backing ConfigMap shares it.
pub fn state_name(template: &str) -> String {
    format!("{STATE_NAME_PREFIX}-{template}")
        .replace('_', "-")
        .to_lowercase()
}

/// Audience name for a pod: `generateName` when set, else `name`.
///
/// Pods created by a controller carry only `generateName` at admission time.
pub fn member_name(meta: &ObjectMeta) -> Option<String> {
    meta.generate_name
        .as_ref()
        .filter(|n| !n.is_empty())
        .or_else(|| meta.name.as_ref().filter(|n| !n.is_empty()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_name_is_case_and_separator_normalized() {
        assert_eq!(state_name("Vault_Agent"), "cmstate-vault-agent");
        assert_eq!(state_name("vault-agent"), "cmstate-vault-agent");
        assert_eq!(state_name("VAULT_AGENT"), state_name("vault_agent"));
    }

    #[test]
    fn member_name_prefers_generate_name() {
        let meta = ObjectMeta {
            name: Some("web-abc12".to_string()),
            generate_name: Some("web-".to_string()),
            ..Default::default()
        };
        assert_eq!(member_name(&meta).as_deref(), Some("web-"));
    }

    #[test]
    fn member_name_falls_back_to_name() {
        let meta = ObjectMeta {
            name: Some("standalone".to_string()),
            generate_name: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(member_name(&meta).as_deref(), Some("standalone"));
        assert_eq!(member_name(&ObjectMeta::default()), None);
    }
}
