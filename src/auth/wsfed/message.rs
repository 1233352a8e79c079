//! WS-Federation passive protocol messages.

use std::collections::BTreeMap;

use url::{Url, form_urlencoded};

pub const WA_SIGN_IN: &str = "wsignin1.0";
pub const WA_SIGN_OUT: &str = "wsignout1.0";

/// A WS-Federation message, either parsed from a form post or built for a
/// redirect to the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WsFederationMessage {
    parameters: BTreeMap<String, String>,
}

impl WsFederationMessage {
    pub fn sign_in(wtrealm: Option<&str>, wctx: &str, wreply: Option<&str>) -> Self {
        let mut message = Self::default();
        message.set("wa", WA_SIGN_IN);
        if let Some(realm) = wtrealm {
            message.set("wtrealm", realm);
        }
        message.set("wctx", wctx);
        if let Some(reply) = wreply {
            message.set("wreply", reply);
        }
        message
    }

    pub fn sign_out(wtrealm: Option<&str>, wreply: Option<&str>) -> Self {
        let mut message = Self::default();
        message.set("wa", WA_SIGN_OUT);
        if let Some(realm) = wtrealm {
            message.set("wtrealm", realm);
        }
        if let Some(reply) = wreply {
            message.set("wreply", reply);
        }
        message
    }

    /// Parse an `application/x-www-form-urlencoded` body. Later duplicates win.
    pub fn from_form(body: &[u8]) -> Self {
        Self {
            parameters: form_urlencoded::parse(body).into_owned().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(name.into(), value.into());
    }

    pub fn wa(&self) -> Option<&str> {
        self.get("wa")
    }

    pub fn wresult(&self) -> Option<&str> {
        self.get("wresult")
    }

    pub fn wctx(&self) -> Option<&str> {
        self.get("wctx")
    }

    pub fn is_sign_in_message(&self) -> bool {
        self.wa() == Some(WA_SIGN_IN)
    }

    /// Issuer URL with this message appended to any existing query.
    pub fn create_url(&self, issuer_address: &Url) -> Url {
        let mut url = issuer_address.clone();
        {
            let mut query = url.query_pairs_mut();
            for (name, value) in &self.parameters {
                query.append_pair(name, value);
            }
        }
        url
    }
}
