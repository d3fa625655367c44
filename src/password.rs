//! Password resolution
//!
//! Three sources, tried in order: a literal `pass` directive, a `passcmd`
//! shelled out to and read from stdout, or an interactive no-echo prompt as
//! a last resort (spec.md §6.1).

use std::collections::HashMap;
use std::process::Command;

use secrecy::SecretString;

use crate::errors::{MailwatchError, MailwatchResult};
use crate::model::Store;

/// How a store's password was configured.
#[derive(Debug, Clone)]
pub enum PasswordSource {
    Literal(String),
    Command(String),
    Prompt,
}

pub fn resolve(store_name: &str, source: &PasswordSource) -> MailwatchResult<SecretString> {
    match source {
        PasswordSource::Literal(p) => Ok(SecretString::from(p.clone())),
        PasswordSource::Command(cmd) => run_passcmd(cmd),
        PasswordSource::Prompt => {
            let prompt = format!("Password ({store_name}): ");
            let entered = rpassword::prompt_password(prompt)
                .map_err(|e| MailwatchError::Credential(format!("reading password: {e}")))?;
            Ok(SecretString::from(entered))
        }
    }
}

/// Resolve every IMAP store's password in place. Call this only after
/// filtering `stores` down to the ones a selected channel actually
/// references, so an unrelated or unselected account is never shelled out
/// for, or interactively prompted for, a password it doesn't need.
pub fn resolve_store_passwords(stores: &mut HashMap<String, Store>) -> MailwatchResult<()> {
    for store in stores.values_mut() {
        if let Store::Imap(imap_store) = store {
            let pass = resolve(&imap_store.name, &imap_store.pass_source)?;
            imap_store.pass = Some(pass);
        }
    }
    Ok(())
}

fn run_passcmd(cmd: &str) -> MailwatchResult<SecretString> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .map_err(|e| MailwatchError::Credential(format!("running passcmd failed: {e}")))?;
    if !output.status.success() {
        return Err(MailwatchError::Credential(format!(
            "passcmd exited with {}",
            output.status
        )));
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let trimmed = text.trim_end_matches(['\n', '\r']);
    if trimmed.is_empty() {
        return Err(MailwatchError::Credential(
            "passcmd produced no output".to_owned(),
        ));
    }
    Ok(SecretString::from(trimmed.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passcmd_trims_trailing_newline() {
        let result = run_passcmd("printf 'hunter2\\n'").unwrap();
        assert_eq!(
            secrecy::ExposeSecret::expose_secret(&result),
            "hunter2"
        );
    }

    #[test]
    fn passcmd_failure_is_an_error() {
        assert!(run_passcmd("exit 7").is_err());
    }
}
