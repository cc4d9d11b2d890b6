use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Context holds the attributes of the entity a feature is evaluated for.
///
/// The well-known fields are used by stickiness resolution; anything else lives in
/// `properties` and can be addressed by name through [Context::value_of].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    remote_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    environment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    app_name: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    properties: HashMap<String, String>,
}

impl Context {
    /// Create a new [ContextBuilder].
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Look up an attribute by the name servers use for it, falling back to custom properties.
    pub fn value_of(&self, name: &str) -> Option<&str> {
        match name {
            "userId" => self.user_id(),
            "sessionId" => self.session_id(),
            "remoteAddress" => self.remote_address(),
            "environment" => self.environment(),
            "appName" => self.app_name(),
            _ => self.properties.get(name).map(String::as_str),
        }
    }

    /// Fill in environment and app name from the client configuration where the caller left
    /// them unset.
    pub fn with_static_fields(&self, environment: &str, app_name: &str) -> Context {
        let mut context = self.clone();
        if context.environment.is_none() {
            context.environment = Some(environment.to_string());
        }
        if context.app_name.is_none() {
            context.app_name = Some(app_name.to_string());
        }
        context
    }
}

/// Contains methods for configuring a context.
#[derive(Clone, Debug, Default)]
pub struct ContextBuilder {
    user_id: Option<String>,
    session_id: Option<String>,
    remote_address: Option<String>,
    environment: Option<String>,
    app_name: Option<String>,
    properties: HashMap<String, String>,
}

impl ContextBuilder {
    pub fn user_id(&mut self, user_id: impl Into<String>) -> &mut Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session_id(&mut self, session_id: impl Into<String>) -> &mut Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn remote_address(&mut self, remote_address: impl Into<String>) -> &mut Self {
        self.remote_address = Some(remote_address.into());
        self
    }

    pub fn environment(&mut self, environment: impl Into<String>) -> &mut Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn app_name(&mut self, app_name: impl Into<String>) -> &mut Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn property(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn build(&self) -> Context {
        Context {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            remote_address: self.remote_address.clone(),
            environment: self.environment.clone(),
            app_name: self.app_name.clone(),
            properties: self.properties.clone(),
        }
    }
}
