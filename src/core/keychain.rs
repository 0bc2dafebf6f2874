//! OS keychain entries for provider API keys and the sandbox token.

use keyring::Entry;

const SERVICE_NAME: &str = "onyx-cli";

/// Entry holding the hosted sandbox API token.
pub const SANDBOX_TOKEN_ENTRY: &str = "codesandbox";

pub fn store_api_key(provider: &str, api_key: &str) -> anyhow::Result<()> {
    let entry = Entry::new(SERVICE_NAME, provider)?;
    entry.set_password(api_key.trim())?;
    Ok(())
}

pub fn get_api_key(provider: &str) -> Option<String> {
    let entry = Entry::new(SERVICE_NAME, provider).ok()?;
    entry.get_password().ok().filter(|k| !k.is_empty())
}

pub fn delete_api_key(provider: &str) -> anyhow::Result<()> {
    let entry = Entry::new(SERVICE_NAME, provider)?;
    entry.delete_credential()?;
    Ok(())
}

pub fn store_sandbox_token(token: &str) -> anyhow::Result<()> {
    store_api_key(SANDBOX_TOKEN_ENTRY, token)
}

#[must_use]
pub fn get_sandbox_token() -> Option<String> {
    get_api_key(SANDBOX_TOKEN_ENTRY)
}

pub fn delete_sandbox_token() -> anyhow::Result<()> {
    delete_api_key(SANDBOX_TOKEN_ENTRY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keychain_roundtrip() {
        let test_provider = "onyx-cli-test-provider";
        let test_key = "test-api-key-12345";

        let _ = delete_api_key(test_provider);

        if store_api_key(test_provider, test_key).is_err() {
            eprintln!("Keychain not available in test environment, skipping");
            return;
        }

        let retrieved = get_api_key(test_provider);
        if retrieved.is_none() {
            eprintln!("Keychain read failed (mock backend?), skipping");
            return;
        }

        assert_eq!(retrieved, Some(test_key.to_string()));

        delete_api_key(test_provider).expect("should delete key");
        assert_eq!(get_api_key(test_provider), None);
    }
}
