//! TeamVault CLI - offline tooling for identities and snapshot blobs.
//!
//! Nothing here talks to a server. `identity` works on exported key bundles,
//! `snapshot` on downloaded blobs, and `demo` runs a full team workflow
//! against the in-memory server.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use zeroize::Zeroizing;

use teamvault_common::{ContentHash, Error as VaultError, KeyEpoch, TeamId, TeamRole, UserId, VaultId};
use teamvault_crypto::{AeadEnvelope, IdentityKeys, KdfParams, KeyBundle, PublicIdentity, VaultKey};
use teamvault_storage::MemoryBackend;
use teamvault_vault::{ClientConfig, Entry, Snapshot, SnapshotCodec, VaultClient};

#[derive(Parser)]
#[command(name = "teamvault")]
#[command(about = "TeamVault - zero-knowledge team password vault tooling")]
#[command(version)]
struct Cli {
    /// Enable verbose logging. `RUST_LOG` takes precedence when set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage password-sealed identity bundles.
    #[command(subcommand)]
    Identity(IdentityCommand),

    /// Examine encrypted snapshot blobs.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),

    /// Run a two-user team workflow against an in-memory server.
    Demo,
}

#[derive(Subcommand)]
enum IdentityCommand {
    /// Generate a new identity and seal it under a password.
    Init {
        /// Where to write the key bundle.
        #[arg(short, long)]
        out: PathBuf,

        /// KDF strength: "interactive", "moderate", or "sensitive".
        #[arg(short, long, default_value = "moderate")]
        strength: String,

        /// Read the password from this environment variable instead of prompting.
        #[arg(long, value_name = "VAR")]
        password_env: Option<String>,

        /// Overwrite an existing bundle.
        #[arg(long)]
        force: bool,
    },

    /// Check that a password opens a key bundle.
    Check {
        /// Key bundle to open.
        #[arg(short, long)]
        bundle: PathBuf,

        /// Read the password from this environment variable instead of prompting.
        #[arg(long, value_name = "VAR")]
        password_env: Option<String>,
    },
}

#[derive(Subcommand)]
enum SnapshotCommand {
    /// Show the public header of a snapshot blob. Needs no key.
    Inspect {
        /// Snapshot blob.
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Decrypt a snapshot blob with its vault key.
    Decrypt {
        /// Snapshot blob.
        #[arg(short, long)]
        file: PathBuf,

        /// Vault the blob belongs to.
        #[arg(long)]
        vault: String,

        /// Key epoch the blob was sealed at.
        #[arg(long, default_value_t = 0)]
        epoch: KeyEpoch,

        /// Environment variable holding the base64 vault key.
        #[arg(long, value_name = "VAR")]
        key_env: String,

        /// Print passwords instead of masking them.
        #[arg(long)]
        reveal: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Identity(IdentityCommand::Init {
            out,
            strength,
            password_env,
            force,
        }) => {
            let params = KdfParams::from_preset(&strength)?;
            let password = read_new_password(password_env.as_deref())?;
            let public = cmd_identity_init(&out, password, params, force).await?;
            println!("Identity created: {}", out.display());
            print_public(&public);
            Ok(())
        }

        Commands::Identity(IdentityCommand::Check {
            bundle,
            password_env,
        }) => {
            let password = read_password("Password: ", password_env.as_deref())?;
            let public = cmd_identity_check(&bundle, password).await?;
            println!("Password opens {}", bundle.display());
            print_public(&public);
            Ok(())
        }

        Commands::Snapshot(SnapshotCommand::Inspect { file }) => {
            let info = cmd_snapshot_inspect(&file).await?;
            println!("Snapshot blob {}", file.display());
            println!("  Format:      v{} {}", info.version, info.kind);
            println!("  Cipher:      {} (envelope v{})", info.alg, info.envelope_version);
            println!("  Ciphertext:  {} bytes", info.ciphertext_len);
            match &info.binding {
                Some(binding) => println!("  Bound to:    {}", binding),
                None => println!("  Bound to:    (nothing)"),
            }
            println!("  Content hash: {}", info.content_hash.as_str());
            Ok(())
        }

        Commands::Snapshot(SnapshotCommand::Decrypt {
            file,
            vault,
            epoch,
            key_env,
            reveal,
        }) => {
            let vault_id = VaultId::new(vault).context("Invalid vault id")?;
            let key = key_from_env(&key_env)?;
            let snapshot = cmd_snapshot_decrypt(&file, &vault_id, epoch, &key).await?;
            print_snapshot(&snapshot, reveal);
            Ok(())
        }

        Commands::Demo => cmd_demo().await,
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Read a password from `env` if given, otherwise prompt.
fn read_password(prompt: &str, env: Option<&str>) -> Result<Zeroizing<String>> {
    let password = match env {
        Some(var) => std::env::var(var)
            .with_context(|| format!("Environment variable {} is not set", var))?,
        None => rpassword::prompt_password(prompt).context("Failed to read password")?,
    };
    Ok(Zeroizing::new(password))
}

fn read_new_password(env: Option<&str>) -> Result<Zeroizing<String>> {
    let password = read_password("New password: ", env)?;
    if env.is_none() {
        let confirm = read_password("Confirm password: ", None)?;
        if *password != *confirm {
            bail!("Passwords do not match");
        }
    }
    Ok(password)
}

fn key_from_env(var: &str) -> Result<VaultKey> {
    let encoded = Zeroizing::new(
        std::env::var(var).with_context(|| format!("Environment variable {} is not set", var))?,
    );
    let bytes = Zeroizing::new(
        STANDARD
            .decode(encoded.trim())
            .context("Vault key is not valid base64")?,
    );
    Ok(VaultKey::from_slice(&bytes)?)
}

fn print_public(public: &PublicIdentity) {
    println!("  Encryption key: {}", STANDARD.encode(public.enc_public_key));
    println!("  Signing key:    {}", STANDARD.encode(public.sign_public_key));
    println!("  Fingerprint:    {}", ContentHash::of(&public.enc_public_key).as_str());
}

/// Generate an identity and write its sealed bundle to `out`.
async fn cmd_identity_init(
    out: &Path,
    password: Zeroizing<String>,
    params: KdfParams,
    force: bool,
) -> Result<PublicIdentity> {
    if password.is_empty() {
        bail!("Password cannot be empty");
    }
    if !force && tokio::fs::try_exists(out).await.unwrap_or(false) {
        bail!("{} already exists; pass --force to replace it", out.display());
    }

    info!(strength = ?params, "generating identity");
    let (public, bundle) = tokio::task::spawn_blocking(move || {
        let keys = IdentityKeys::generate();
        let bundle = KeyBundle::seal(&keys, password.as_bytes(), &params)?;
        Ok::<_, VaultError>((keys.public(), bundle))
    })
    .await
    .context("Key generation task failed")??;

    tokio::fs::write(out, bundle.to_json()?)
        .await
        .with_context(|| format!("Failed to write {}", out.display()))?;
    debug!(path = %out.display(), "bundle written");
    Ok(public)
}

/// Open the bundle at `path`. A wrong password is reported as such.
async fn cmd_identity_check(path: &Path, password: Zeroizing<String>) -> Result<PublicIdentity> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let bundle = KeyBundle::from_json(&json).context("Not a key bundle")?;

    let opened = tokio::task::spawn_blocking(move || bundle.open(password.as_bytes()))
        .await
        .context("Unlock task failed")?;
    match opened {
        Ok(keys) => Ok(keys.public()),
        Err(VaultError::Credential) => bail!("Wrong password"),
        Err(e) => Err(e.into()),
    }
}

#[derive(Deserialize)]
struct BlobOutline {
    v: u32,
    kind: String,
    enc: AeadEnvelope,
}

/// What can be learned from a snapshot blob without its key.
#[derive(Debug)]
struct BlobInfo {
    version: u32,
    kind: String,
    alg: String,
    envelope_version: u32,
    ciphertext_len: usize,
    binding: Option<String>,
    content_hash: ContentHash,
}

async fn cmd_snapshot_inspect(path: &Path) -> Result<BlobInfo> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let outline: BlobOutline =
        serde_json::from_slice(&bytes).context("Not a snapshot blob")?;
    let ciphertext = STANDARD
        .decode(&outline.enc.cipher_b64)
        .context("Ciphertext is not valid base64")?;
    let binding = outline
        .enc
        .associated_data()?
        .map(|ad| String::from_utf8_lossy(&ad).into_owned());

    Ok(BlobInfo {
        version: outline.v,
        kind: outline.kind,
        alg: outline.enc.alg,
        envelope_version: outline.enc.v,
        ciphertext_len: ciphertext.len(),
        binding,
        content_hash: ContentHash::of(&bytes),
    })
}

async fn cmd_snapshot_decrypt(
    path: &Path,
    vault_id: &VaultId,
    epoch: KeyEpoch,
    key: &VaultKey,
) -> Result<Snapshot> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    SnapshotCodec::open_for(vault_id, epoch, key, &bytes)
        .with_context(|| format!("Failed to decrypt snapshot of vault {} at epoch {}", vault_id, epoch))
}

fn print_snapshot(snapshot: &Snapshot, reveal: bool) {
    println!(
        "Snapshot v{}: {} entries, {} folders",
        snapshot.v,
        snapshot.entries.len(),
        snapshot.folders.len()
    );
    for folder in &snapshot.folders {
        println!("  [DIR]   {} ({})", folder.title, folder.id);
    }
    for entry in &snapshot.entries {
        let password = if reveal { entry.password.as_str() } else { "********" };
        println!(
            "  [ENTRY] {} user={} password={}{}",
            entry.title,
            entry.username,
            password,
            entry
                .url
                .as_deref()
                .map(|url| format!(" url={}", url))
                .unwrap_or_default()
        );
    }
}

async fn enroll_demo_user(
    backend: &Arc<MemoryBackend>,
    config: &ClientConfig,
    name: &str,
    password: &str,
) -> Result<(UserId, VaultClient)> {
    let user = UserId::new(name)?;
    backend.register_user(&user).await?;
    let token = backend.login(&user).await?;
    let client = VaultClient::new(backend.clone(), config.clone());
    client.enroll(user.clone(), token, password).await?;
    println!("{} enrolled", user);
    Ok((user, client))
}

/// Alice builds a team, Bob joins and is then removed with a key rotation.
async fn cmd_demo() -> Result<()> {
    const PASSWORD: &str = "CorrectHorse1";

    let backend = Arc::new(MemoryBackend::new());
    let config = ClientConfig::default().with_auto_lock(None);
    let team = TeamId::new("ops")?;

    let (alice_id, alice) = enroll_demo_user(&backend, &config, "alice", PASSWORD).await?;
    let (bob_id, bob) = enroll_demo_user(&backend, &config, "bob", PASSWORD).await?;

    alice.create_team(&team).await?;
    alice
        .upsert_entry(
            Entry::new("Production DB", "root", "s3cret", alice_id.clone())
                .with_team(team.clone())
                .with_url("postgres://db.internal"),
        )
        .await?;
    alice
        .upsert_entry(Entry::new("Bank", "alice", "1234", alice_id.clone()))
        .await?;
    if let Some(failure) = alice.flush_saves().await.into_iter().next() {
        bail!("save to {} failed: {}", failure.vault_id, failure.error);
    }
    println!("alice created team {} and saved 2 entries", team);

    alice.invite_member(&team, &bob_id, TeamRole::Editor).await?;
    bob.accept_invitation(&team).await?;
    let view = bob.view().await?;
    println!("bob joined {} and sees {} entries:", team, view.entries.len());
    for entry in &view.entries {
        println!("  {} (from {})", entry.item.title, entry.source);
    }

    let rotated = alice.remove_member(&team, &bob_id).await?;
    println!("alice removed bob; team key is now at epoch {}", rotated.epoch);

    let report = bob.refresh().await?;
    println!(
        "bob refreshed: {} vaults loaded, {} entries visible",
        report.loaded.len() + report.empty.len(),
        bob.view().await?.entries.len()
    );

    alice.lock().await;
    bob.lock().await;
    Ok(())
}
