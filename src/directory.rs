//! Fake directory content: credential list for binds and believable search results.

use crate::bind::BindCheck;
use crate::config::RootDseConfig;
use crate::ldap_handler::AuthState;
use crate::response::SearchResultEntry;
use crate::search::{SearchFunc, SearchRequest, SearchScope};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use tracing::debug;

/// Read-only "name:password" list consulted by every connection.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    users: HashMap<String, String>,
    allow_anonymous: bool,
}

impl CredentialStore {
    pub fn new<S: AsRef<str>>(credentials: &[S], allow_anonymous: bool) -> Result<Self> {
        let mut users = HashMap::with_capacity(credentials.len());
        for cred in credentials {
            let cred = cred.as_ref();
            let (name, password) = cred
                .split_once(':')
                .ok_or_else(|| anyhow!("Credential {:?} must have the form name:password", cred))?;
            users.insert(name.to_string(), password.to_string());
        }
        Ok(Self {
            users,
            allow_anonymous,
        })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl BindCheck for CredentialStore {
    fn bind_check(&self, dn: &str, password: &[u8]) -> bool {
        if dn.is_empty() && password.is_empty() {
            debug!("Anonymous bind, allowed: {}", self.allow_anonymous);
            return self.allow_anonymous;
        }
        self.users
            .get(dn)
            .map(|expected| expected.as_bytes() == password)
            .unwrap_or(false)
    }
}

const USER_FILTER_ATTRS: [&str; 3] = ["uid", "cn", "sAMAccountName"];

/// Search producer that never touches real data.
#[derive(Debug, Clone, Default)]
pub struct SyntheticDirectory {
    root_dse: RootDseConfig,
}

impl SyntheticDirectory {
    pub fn new(root_dse: RootDseConfig) -> Self {
        Self { root_dse }
    }

    pub fn root_dse_entry(&self) -> SearchResultEntry {
        SearchResultEntry::new("")
            .with("namingContexts", self.root_dse.naming_contexts.clone())
            .with("supportedLDAPVersion", self.root_dse.supported_ldap_version.clone())
            .with("supportedExtension", self.root_dse.supported_extension.clone())
            .with("vendorName", self.root_dse.vendor_name.clone())
            .with("vendorVersion", self.root_dse.vendor_version.clone())
    }

    fn user_entry(&self, base_dn: &str, name: &str) -> SearchResultEntry {
        let base = if base_dn.is_empty() {
            self.root_dse.naming_contexts.first().map(String::as_str).unwrap_or("")
        } else {
            base_dn
        };
        let dn = if base.is_empty() {
            format!("cn={}", name)
        } else {
            format!("cn={},{}", name, base)
        };
        SearchResultEntry::new(dn)
            .with("sn", name)
            .with("cn", name)
            .with("uid", name)
            .with("homeDirectory", format!("/home/{}", name))
            .with(
                "objectClass",
                vec!["top".to_string(), "posixAccount".to_string(), "inetOrgPerson".to_string()],
            )
    }
}

fn is_root_dse_query(request: &SearchRequest) -> bool {
    (request.base_dn.is_empty() && request.scope == SearchScope::BaseObject)
        || (request.filter_attr.eq_ignore_ascii_case("objectclass") && request.filter_value.is_empty())
}

impl SearchFunc for SyntheticDirectory {
    fn search(&self, request: &SearchRequest, auth: AuthState) -> Option<Vec<SearchResultEntry>> {
        if is_root_dse_query(request) {
            return Some(vec![self.root_dse_entry()]);
        }
        if auth == AuthState::Anonymous {
            return None;
        }

        let value = request.filter_value.as_str();
        let is_user_lookup = USER_FILTER_ATTRS
            .iter()
            .any(|attr| request.filter_attr.eq_ignore_ascii_case(attr));
        if is_user_lookup && !value.is_empty() && value != "*" {
            return Some(vec![self.user_entry(&request.base_dn, value)]);
        }
        Some(Vec::new())
    }
}
