//! Web Access Control documents for app containers.

/// Access policy applied to a container and everything inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AclPolicy {
    /// Anyone may read, only the owner may write.
    PublicReadOwnerWrite,
    /// Anyone may append (deliver), only the owner may read.
    PublicAppendPrivateRead,
    PrivateOwnerOnly,
}

const PREFIXES: &str = "@prefix acl: <http://www.w3.org/ns/auth/acl#>.\n\
                        @prefix foaf: <http://xmlns.com/foaf/0.1/>.\n";

pub(crate) fn render_acl(policy: AclPolicy, resource: &str, owner_web_id: &str) -> String {
    let mut acl = format!(
        "{PREFIXES}\n\
         <#owner> a acl:Authorization;\n    \
         acl:agent <{owner_web_id}>;\n    \
         acl:accessTo <{resource}>;\n    \
         acl:default <{resource}>;\n    \
         acl:mode acl:Read, acl:Write, acl:Control.\n"
    );
    let public_mode = match policy {
        AclPolicy::PublicReadOwnerWrite => Some("acl:Read"),
        AclPolicy::PublicAppendPrivateRead => Some("acl:Append"),
        AclPolicy::PrivateOwnerOnly => None,
    };
    if let Some(mode) = public_mode {
        acl.push_str(&format!(
            "\n<#public> a acl:Authorization;\n    \
             acl:agentClass foaf:Agent;\n    \
             acl:accessTo <{resource}>;\n    \
             acl:default <{resource}>;\n    \
             acl:mode {mode}.\n"
        ));
    }
    acl
}
