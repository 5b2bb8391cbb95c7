//! `vmpull login` command: store registry credentials.

use clap::Args;
use vmpull_runtime::oci::CredentialStore;

#[derive(Args)]
pub struct LoginArgs {
    /// Registry server (default: index.docker.io)
    pub server: Option<String>,

    /// Username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password
    #[arg(short, long)]
    pub password: Option<String>,

    /// Read password from stdin
    #[arg(long)]
    pub password_stdin: bool,
}

fn prompt(label: &str) -> std::io::Result<String> {
    if !label.is_empty() {
        eprint!("{label}: ");
    }
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

pub async fn execute(args: LoginArgs) -> Result<(), Box<dyn std::error::Error>> {
    let server = args.server.unwrap_or_else(|| "index.docker.io".to_string());

    let username = match args.username {
        Some(u) => u,
        None => prompt("Username")?,
    };
    let password = match (args.password_stdin, args.password) {
        (true, _) => prompt("")?,
        (false, Some(p)) => p,
        (false, None) => prompt("Password")?,
    };

    if username.is_empty() || password.is_empty() {
        return Err("Username and password are required".into());
    }

    CredentialStore::for_storage(&super::storage()).store(&server, &username, &password)?;

    println!("Login Succeeded");
    Ok(())
}
