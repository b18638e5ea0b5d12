use {
    anyhow::{Result, bail},
    clap::Subcommand,
    deskbridge_config::DeskbridgeConfig,
    deskbridge_gateway::services,
    deskbridge_matrix::Homeserver,
    rand::{Rng, distr::Alphanumeric},
    secrecy::ExposeSecret,
};

const GENERATED_PASSWORD_LEN: usize = 24;

#[derive(Subcommand)]
pub enum AccountsAction {
    /// Create an account with the registration shared secret.
    Create {
        /// Localpart of the new user (`support` for `@support:server`).
        localpart: String,
        /// Password; a random one is generated when omitted.
        #[arg(long, env = "DESKBRIDGE_ACCOUNT_PASSWORD")]
        password: Option<String>,
        /// Grant server admin rights.
        #[arg(long)]
        admin: bool,
    },
}

fn generate_password() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}

fn valid_localpart(localpart: &str) -> bool {
    !localpart.is_empty()
        && localpart.chars().all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '=' | '-' | '/')
        })
}

pub async fn handle_accounts(action: AccountsAction, config: &DeskbridgeConfig) -> Result<()> {
    match action {
        AccountsAction::Create {
            localpart,
            password,
            admin,
        } => {
            let localpart = localpart.trim_start_matches('@');
            if !valid_localpart(localpart) {
                bail!("invalid localpart {localpart:?}: use lowercase letters, digits and ._=-/");
            }
            let homeserver = services::homeserver(config)?;
            if !homeserver.can_register() {
                bail!("matrix.registration_shared_secret is not configured");
            }
            let generated = password.is_none();
            let password = password.unwrap_or_else(generate_password);
            let registration = homeserver.register(localpart, &password, admin).await?;

            println!("user_id      = {}", registration.user_id);
            println!(
                "access_token = {}",
                registration.access_token.expose_secret()
            );
            if generated {
                println!("password     = {password}");
            }
            Ok(())
        },
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_passwords_are_alphanumeric() {
        let password = generate_password();
        assert_eq!(password.len(), GENERATED_PASSWORD_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(password, generate_password());
    }

    #[test]
    fn localpart_rules() {
        assert!(valid_localpart("support_bot"));
        assert!(valid_localpart("webchat_abc-1"));
        assert!(!valid_localpart("Support"));
        assert!(!valid_localpart("a b"));
        assert!(!valid_localpart(""));
    }
}
