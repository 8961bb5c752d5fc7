use crate::error::SupervisorError;

/// Login material for one connection attempt
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub saml_cookie: Option<String>,
    /// Authentication group, passed as `--authgroup`
    pub gateway: String,
    /// Server the client connects to
    pub gateway_domain: String,
    /// Appended verbatim after the fixed client flags
    pub extra_args: Vec<String>,
}

/// The secret fed to the client over stdin
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthSecret<'a> {
    Password(&'a str),
    SamlCookie(&'a str),
}

impl AuthSecret<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AuthSecret::Password(s) | AuthSecret::SamlCookie(s) => s.as_bytes(),
        }
    }

    fn user_group(&self) -> &'static str {
        match self {
            AuthSecret::Password(_) => "--usergroup=gateway",
            AuthSecret::SamlCookie(_) => "--usergroup=gateway:prelogin-cookie",
        }
    }
}

impl Credentials {
    /// Check the credentials and pick out the secret.
    ///
    /// User, gateway and gateway domain must be non-empty, and exactly one
    /// of password / SAML cookie must be present and non-empty.
    pub fn validate(&self) -> Result<AuthSecret<'_>, SupervisorError> {
        let missing = [
            ("user", &self.user),
            ("gateway", &self.gateway),
            ("gateway domain", &self.gateway_domain),
        ]
        .into_iter()
        .find(|(_, value)| value.is_empty());
        if let Some((field, _)) = missing {
            return Err(SupervisorError::InvalidCredentials(format!(
                "{} must not be empty",
                field
            )));
        }

        match (self.password.as_deref(), self.saml_cookie.as_deref()) {
            (Some(_), Some(_)) => Err(SupervisorError::InvalidCredentials(
                "password and SAML cookie are mutually exclusive".into(),
            )),
            (None, None) => Err(SupervisorError::InvalidCredentials(
                "either a password or a SAML cookie is required".into(),
            )),
            (Some(""), None) => Err(SupervisorError::InvalidCredentials(
                "password must not be empty".into(),
            )),
            (None, Some("")) => Err(SupervisorError::InvalidCredentials(
                "SAML cookie must not be empty".into(),
            )),
            (Some(password), None) => Ok(AuthSecret::Password(password)),
            (None, Some(cookie)) => Ok(AuthSecret::SamlCookie(cookie)),
        }
    }

    /// Arguments handed to the VPN client for this login.
    ///
    /// The server must stay the last, positional argument.
    pub fn client_args(&self, secret: AuthSecret<'_>) -> Vec<String> {
        let mut args = vec![
            "--non-inter".to_string(),
            "--passwd-on-stdin".to_string(),
            "--protocol=gp".to_string(),
            format!("--authgroup={}", self.gateway),
            secret.user_group().to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args.push(format!("--user={}", self.user));
        args.push(self.gateway_domain.clone());
        args
    }
}
