use clap::{Arg, ArgAction, ArgMatches, Command};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use depotsync::logging::*;
use depotsync::{
	CliProgressCallback, Config, DepotId, InstalledVersion, InstalledVersionStore, LocalDepot,
	ManifestId, Services, SyncBuilder,
};

///////////////////////
// Utility functions //
///////////////////////

fn parse_id<T: std::str::FromStr>(matches: &ArgMatches, name: &str) -> Result<T, Box<dyn Error>> {
	let value = matches.get_one::<String>(name).ok_or(format!("--{} is required", name))?;
	value.parse().map_err(|_| format!("--{}: invalid id {:?}", name, value).into())
}

fn store_path(matches: &ArgMatches) -> Result<PathBuf, Box<dyn Error>> {
	Ok(PathBuf::from(matches.get_one::<String>("store").ok_or("--store is required")?))
}

/// Cancel `token` on the first Ctrl-C
fn cancel_on_interrupt(token: CancellationToken) {
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			warn!("Interrupted, cancelling sync");
			token.cancel();
		}
	});
}

//////////////////
// Subcommands  //
//////////////////

fn publish(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
	let src = matches.get_one::<String>("src").ok_or("publish: source directory required")?;
	let depot_id: DepotId = parse_id(matches, "depot")?;
	let manifest_id: ManifestId = parse_id(matches, "manifest")?;

	let depot = LocalDepot::open(&store_path(matches)?)?;
	let manifest = depot.publish(Path::new(src), depot_id, manifest_id)?;
	println!(
		"Published depot {} manifest {} ({} entries, {} bytes)",
		depot_id,
		manifest_id,
		manifest.files.len(),
		manifest.total_size()
	);
	Ok(())
}

async fn sync(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
	let mut config = Config::load(matches.get_one::<String>("config").map(Path::new))?;
	if matches.get_flag("verify-all") {
		config.verify_all = true;
	}
	if let Some(n) = matches.get_one::<String>("max-downloads") {
		config.max_downloads = n.parse().map_err(|_| format!("--max-downloads: invalid number {:?}", n))?;
	}

	let app_id = parse_id(matches, "app")?;
	let depot_id: DepotId = parse_id(matches, "depot")?;
	let depot = Arc::new(LocalDepot::open(&store_path(matches)?)?);
	let manifest_id: ManifestId = match matches.get_one::<String>("manifest") {
		Some(_) => parse_id(matches, "manifest")?,
		None => depot
			.latest_manifest(depot_id)
			.ok_or(format!("depot {} has no published manifest", depot_id))?,
	};
	let target_dir = match matches.get_one::<String>("dir") {
		Some(dir) => PathBuf::from(dir),
		None => config.install_directory.join(depot_id.to_string()),
	};

	let engine = SyncBuilder::new(Services::from_backend(depot))
		.config(config)
		.on_progress(CliProgressCallback::new(!matches.get_flag("no-progress")))
		.build()?;

	let cancel = CancellationToken::new();
	cancel_on_interrupt(cancel.clone());

	info!("Syncing depot {} to manifest {} in {}", depot_id, manifest_id, target_dir.display());
	let summary = engine.start_sync(app_id, depot_id, manifest_id, &target_dir, &cancel).await?;
	info!("{} files up to date in {}", summary.file_count, target_dir.display());
	Ok(())
}

fn status(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
	let dir = matches.get_one::<String>("dir").ok_or("status: install directory required")?;
	let dir = Path::new(dir);
	if !InstalledVersionStore::db_path(dir).exists() {
		println!("{}: no depots installed", dir.display());
		return Ok(());
	}

	let store = InstalledVersionStore::open(dir)?;
	for (depot_id, version) in store.list()? {
		match version {
			InstalledVersion::Manifest(id) => println!("depot {}: manifest {}", depot_id, id),
			InstalledVersion::Incomplete => println!("depot {}: incomplete", depot_id),
		}
	}
	Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	init_tracing("info");

	let matches = Command::new("depotsync")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Chunked content depot synchronizer")
		.subcommand_required(true)
		.subcommand(
			Command::new("publish")
				.about("Publish a directory as a depot version into a local store")
				.arg(Arg::new("src").required(true))
				.arg(Arg::new("store").long("store").required(true).value_name("DIR"))
				.arg(Arg::new("depot").long("depot").required(true).value_name("ID"))
				.arg(Arg::new("manifest").long("manifest").required(true).value_name("ID")),
		)
		.subcommand(
			Command::new("sync")
				.about("Bring an install directory to a depot version")
				.arg(Arg::new("store").long("store").required(true).value_name("DIR"))
				.arg(Arg::new("app").long("app").default_value("0").value_name("ID"))
				.arg(Arg::new("depot").long("depot").required(true).value_name("ID"))
				.arg(
					Arg::new("manifest")
						.long("manifest")
						.value_name("ID")
						.help("Manifest to install (default: latest published)"),
				)
				.arg(
					Arg::new("dir")
						.short('d')
						.long("dir")
						.value_name("DIR")
						.help("Install directory (default: <installDirectory>/<depot>)"),
				)
				.arg(Arg::new("config").short('c').long("config").value_name("FILE"))
				.arg(Arg::new("max-downloads").long("max-downloads").value_name("N"))
				.arg(
					Arg::new("verify-all")
						.long("verify-all")
						.action(ArgAction::SetTrue)
						.help("Re-verify files whose content hash did not change"),
				)
				.arg(Arg::new("no-progress").long("no-progress").action(ArgAction::SetTrue)),
		)
		.subcommand(
			Command::new("status")
				.about("Show installed depot versions")
				.arg(Arg::new("dir").required(true)),
		)
		.get_matches();

	match matches.subcommand() {
		Some(("publish", sub)) => publish(sub),
		Some(("sync", sub)) => sync(sub).await,
		Some(("status", sub)) => status(sub),
		_ => Err("unknown subcommand".into()),
	}
}

// vim: ts=4
