use std::io::{self, Write};

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::warn;

use sensordash_core::api::{Method, NewAccount};
use sensordash_core::{ApiClient, Config, SessionEvent};

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_password(label: &str) -> Result<String> {
    let password = rpassword::prompt_password(format!("{}: ", label))?;
    Ok(password)
}

const EVICTION_NOTICE: &str = "Your session has ended. Run `sensordash login` to sign in again.";

/// Tell the user to log in again if the session was evicted while a
/// command was running. Returns whether the notice was written.
fn report_eviction(
    events: &mut broadcast::Receiver<SessionEvent>,
    out: &mut impl Write,
) -> io::Result<bool> {
    while let Ok(event) = events.try_recv() {
        if event == SessionEvent::LoggedOut {
            writeln!(out, "{}", EVICTION_NOTICE)?;
            return Ok(true);
        }
    }
    Ok(false)
}

pub async fn login(api: &ApiClient, config: &mut Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.last_username.clone()) {
        Some(name) if !name.is_empty() => {
            let entered = prompt(&format!("Username [{}]", name))?;
            if entered.is_empty() { name } else { entered }
        }
        _ => prompt("Username")?,
    };
    let password = prompt_password("Password")?;

    println!("\nAuthenticating...");
    let identity = api.login(&username, &password).await?;

    config.last_username = Some(username);
    if let Err(e) = config.save() {
        warn!(error = %e, "Failed to save config");
    }

    println!("Logged in as {}", identity.display_name());
    Ok(())
}

pub async fn register(api: &ApiClient) -> Result<()> {
    let account = NewAccount {
        username: prompt("Username")?,
        first_name: prompt("First name")?,
        last_name: prompt("Last name")?,
        email: prompt("Email")?,
        password: prompt_password("Password")?,
    };
    if prompt_password("Confirm password")? != account.password {
        anyhow::bail!("Passwords do not match");
    }

    let message = api.register(&account).await?;
    println!("{}", message);
    println!("You can now run `sensordash login`.");
    Ok(())
}

pub fn logout(api: &ApiClient) -> Result<()> {
    api.logout();
    println!("Logged out");
    Ok(())
}

pub fn status(api: &ApiClient, api_url: &str) -> Result<()> {
    let session = api.session().session();
    println!("API: {}", api_url);
    match (session.is_authenticated(), session.identity) {
        (true, Some(identity)) => println!("Logged in as {} ({})", identity.display_name(), identity.username),
        (true, None) => println!("Logged in"),
        (false, _) => println!("Not logged in"),
    }
    Ok(())
}

pub async fn whoami(api: &ApiClient) -> Result<()> {
    if !api.session().is_authenticated() {
        anyhow::bail!("Not logged in. Run `sensordash login` first.");
    }
    let mut events = api.session().subscribe();
    let result = api.profile().await;
    report_eviction(&mut events, &mut io::stderr())?;

    let identity = result?;
    println!("Name:     {}", identity.display_name());
    println!("Username: {}", identity.username);
    if let Some(email) = identity.email {
        println!("Email:    {}", email);
    }
    Ok(())
}

pub async fn change_password(api: &ApiClient) -> Result<()> {
    if !api.session().is_authenticated() {
        anyhow::bail!("Not logged in. Run `sensordash login` first.");
    }
    let current = prompt_password("Current password")?;
    let new = prompt_password("New password")?;
    if prompt_password("Confirm new password")? != new {
        anyhow::bail!("New passwords do not match");
    }

    let mut events = api.session().subscribe();
    let result = api.change_password(&current, &new).await;
    // A successful change logs out on purpose; only a failed one is an eviction.
    if result.is_err() {
        report_eviction(&mut events, &mut io::stderr())?;
    }

    let message = result?;
    println!("{}", message);
    println!("You have been logged out. Run `sensordash login` with your new password.");
    Ok(())
}

pub async fn request(api: &ApiClient, method: &str, path: &str, data: Option<String>) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;
    if let Some(ref body) = data {
        serde_json::from_str::<serde_json::Value>(body).context("--data is not valid JSON")?;
    }

    let mut events = api.session().subscribe();
    let result = api.request(method, path, data.map(String::into_bytes)).await;
    report_eviction(&mut events, &mut io::stderr())?;

    let response = result?;
    eprintln!("{}", response.status());
    match response.json::<serde_json::Value>() {
        Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Err(_) => println!("{}", response.text()),
    }

    if !response.is_success() {
        anyhow::bail!("Request failed with status {}", response.status());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_eviction_writes_notice_on_logout() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(SessionEvent::Refreshed).unwrap();
        tx.send(SessionEvent::LoggedOut).unwrap();

        let mut out = Vec::new();
        assert!(report_eviction(&mut rx, &mut out).unwrap());
        assert_eq!(String::from_utf8(out).unwrap(), format!("{}\n", EVICTION_NOTICE));
    }

    #[test]
    fn test_report_eviction_silent_without_logout() {
        let (tx, mut rx) = broadcast::channel(8);
        let mut out = Vec::new();
        assert!(!report_eviction(&mut rx, &mut out).unwrap());

        tx.send(SessionEvent::LoggedIn).unwrap();
        tx.send(SessionEvent::Refreshed).unwrap();
        assert!(!report_eviction(&mut rx, &mut out).unwrap());
        assert!(out.is_empty());
    }

    #[test]
    fn test_report_eviction_notices_once() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(SessionEvent::LoggedOut).unwrap();
        tx.send(SessionEvent::LoggedOut).unwrap();

        let mut out = Vec::new();
        assert!(report_eviction(&mut rx, &mut out).unwrap());
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }
}
