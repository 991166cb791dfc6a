use anyhow::{Context, Result};
use clap::{arg, crate_name, crate_version, Arg, ArgMatches, Command};
use config::{Export, Import, PrivateConfig, Realm, ReplicaConfig};
use keyserver::Keyserver;
use storage::Storage;

#[tokio::main]
async fn main() -> Result<()> {
    // Read the cli parameters.
    let matches = Command::new(crate_name!())
        .version(crate_version!())
        .about("A transparent, end-to-end verifiable key directory.")
        .arg(Arg::new("verbose").multiple_occurrences(true).short('v'))
        .subcommand(
            Command::new("generate")
                .about("Print a fresh key pair to file")
                .arg(arg!(--filename <FILE> "The path to the keyserver keypair")),
        )
        .subcommand(Command::new("run").about("Run a keyserver replica").args(&[
            arg!(--realm <FILE> "The path to the realm file"),
            arg!(--replica <FILE> "The path to the replica configuration"),
            arg!(--keypair <FILE> "The path to the keyserver keypair"),
            arg!(--storage <FILE> "The directory to hold the replicated log"),
        ]))
        .arg_required_else_help(true)
        .get_matches();

    // Configure the logger.
    let log_level = match matches.occurrences_of("verbose") {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_module("keyserver", log_level)
        .filter_module("replication", log_level)
        .filter_module("network", log_level)
        .init();

    // Parse the input parameters.
    match matches.subcommand() {
        Some(("generate", sub_matches)) => PrivateConfig::new()
            .export(sub_matches.value_of("filename").unwrap())
            .context("Failed to generate key pair")?,
        Some(("run", sub_matches)) => spawn(sub_matches)
            .await
            .context("Failed to spawn keyserver")?,
        _ => unreachable!(),
    }
    Ok(())
}

/// Spawn a keyserver replica.
async fn spawn(matches: &ArgMatches) -> Result<()> {
    let realm_file = matches.value_of("realm").unwrap();
    let realm = Realm::import(realm_file).context("Failed to load realm")?;

    let replica_file = matches.value_of("replica").unwrap();
    let replica = ReplicaConfig::import(replica_file).context("Failed to load replica config")?;

    let keypair_file = matches.value_of("keypair").unwrap();
    let private = PrivateConfig::import(keypair_file).context("Failed to load keypair")?;

    let storage_file = matches.value_of("storage").unwrap();
    let db = Storage::new(storage_file).context("Failed to create storage")?;

    let client_addr = realm.provider.address;
    Keyserver::spawn(private, realm, replica, db, client_addr)
        .map_err(|e| anyhow::anyhow!(e.to_string()))
        .context("Failed to start keyserver")?;

    // TODO: better way to prevent the program from exiting....
    loop {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;
    }
}
