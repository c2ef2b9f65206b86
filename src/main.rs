use clap::Parser;
use harvest_locate::config::Config;
use harvest_locate::location::{
    Fix, LocationError, LocationResolver, LocationSource, ManualEntry, PermissionState, ReplayGeolocation,
    ResolvedLocation, ResolverBuilder, StaticPermission,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Harvest Locate: find the delivery address for a marketplace order.
///
/// Refines GPS fixes, reverse geocodes them against several providers,
/// falls back to IP geolocation, and finally to search or manual entry.
///
/// Examples:
///   harvest-locate --fixes fixes.jsonl
///   harvest-locate --gpsd 127.0.0.1:2947
///   harvest-locate --lat 28.6139 --lon 77.2090 --accuracy 12
///   harvest-locate --search "Connaught Place" --pick 1
///   harvest-locate --address "221B Baker Street" --city Delhi --pincode 110001
///   harvest-locate --pincode-lookup 110001
///   harvest-locate --serve --port 3000
#[derive(Parser)]
#[command(name = "harvest-locate", version, about, long_about = None)]
struct Cli {
    /// JSON-lines feed of browser-forwarded fixes.
    #[arg(long)]
    fixes: Option<PathBuf>,

    /// gpsd address of a native GPS receiver (host:port).
    #[arg(long)]
    gpsd: Option<String>,

    /// Answer to the location permission query: granted, denied or unknown.
    #[arg(long, value_parser = parse_permission)]
    permission: Option<PermissionState>,

    /// Search for a place by name instead of detecting.
    #[arg(long)]
    search: Option<String>,

    /// Pick the N-th search result (1-based).
    #[arg(long, requires = "search")]
    pick: Option<usize>,

    /// Latitude of an already accepted fix.
    #[arg(long, allow_hyphen_values = true, requires = "lon")]
    lat: Option<f64>,

    /// Longitude of an already accepted fix.
    #[arg(long, allow_hyphen_values = true, requires = "lat")]
    lon: Option<f64>,

    /// Accuracy radius of that fix in meters.
    #[arg(long)]
    accuracy: Option<f64>,

    /// Manual entry: street address.
    #[arg(long)]
    address: Option<String>,

    /// Manual entry: city.
    #[arg(long)]
    city: Option<String>,

    /// Manual entry: state (optional).
    #[arg(long)]
    state: Option<String>,

    /// Manual entry: 6-digit pincode.
    #[arg(long)]
    pincode: Option<String>,

    /// Look up post-office data for a pincode.
    #[arg(long)]
    pincode_lookup: Option<String>,

    /// Skip the geocode cache.
    #[arg(long)]
    no_cache: bool,

    /// Config file (default ~/.harvest-locate/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run the HTTP API instead of a one-shot lookup.
    #[arg(long)]
    serve: bool,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

fn parse_permission(s: &str) -> Result<PermissionState, String> {
    match s.to_lowercase().as_str() {
        "granted" => Ok(PermissionState::Granted),
        "denied" => Ok(PermissionState::Denied),
        "unknown" | "prompt" => Ok(PermissionState::Unknown),
        _ => Err(format!("Unknown permission '{}'. Use 'granted', 'denied' or 'unknown'.", s)),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    // ── Configuration ───────────────────────────────────────────

    let loaded = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };
    let mut config = loaded.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });
    if cli.no_cache {
        config.cache.enabled = false;
    }
    if cli.gpsd.is_some() {
        config.gps.gpsd = cli.gpsd.clone();
    }
    let tz = config.display.tz().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    if cli.serve {
        let host = cli.host.clone().unwrap_or_else(|| config.server.host.clone());
        let port = cli.port.unwrap_or(config.server.port);
        harvest_locate::server::start(&config, &host, port).await;
        return;
    }

    // ── Resolver ────────────────────────────────────────────────

    let mut builder = ResolverBuilder::from_config(&config);
    if let Some(path) = &cli.fixes {
        builder = builder.geolocation(Arc::new(load_feed(path)));
    }
    if let Some(permission) = cli.permission {
        builder = builder.permissions(Arc::new(StaticPermission(permission)));
    }
    let mut resolver = builder.build();

    let cancel = resolver.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    if let Some(pin) = &cli.pincode_lookup {
        match resolver.lookup_pincode(pin).await {
            Ok(details) => {
                eprintln!("  \u{1F4EE} {}: {}, {}", details.pincode, details.district, details.state);
                print_json(&details);
                return;
            }
            Err(e) => fail(e),
        }
    }

    let outcome = run(&cli, &mut resolver).await;
    match outcome {
        Ok(location) => {
            eprintln!("  {}", location.display_line(tz));
            print_json(&location);
        }
        Err(e) => fail(e),
    }
}

async fn run(cli: &Cli, resolver: &mut LocationResolver) -> Result<ResolvedLocation, LocationError> {
    // Priority: manual form > search > known fix > auto-detect

    if cli.address.is_some() || cli.city.is_some() || cli.pincode.is_some() {
        let entry = ManualEntry {
            address: cli.address.clone().unwrap_or_default(),
            city: cli.city.clone().unwrap_or_default(),
            state: cli.state.clone(),
            pincode: cli.pincode.clone().unwrap_or_default(),
            locality: None,
        };
        return resolver.submit_manual(&entry);
    }

    if let Some(query) = &cli.search {
        let candidates = resolver.search(query).await?;
        if candidates.is_empty() {
            eprintln!("  No places found for '{}'.", query);
            std::process::exit(2);
        }
        let Some(pick) = cli.pick else {
            for (i, c) in candidates.iter().enumerate() {
                eprintln!("    {}. {} ({:.4}, {:.4})", i + 1, c.display_name, c.latitude, c.longitude);
            }
            eprintln!("  Re-run with --pick N to choose one.");
            print_json(&candidates);
            std::process::exit(0);
        };
        let candidate = pick
            .checked_sub(1)
            .and_then(|i| candidates.get(i))
            .unwrap_or_else(|| {
                eprintln!("Error: --pick must be between 1 and {}", candidates.len());
                std::process::exit(1);
            });
        return resolver.select_candidate(candidate);
    }

    if let (Some(lat), Some(lon)) = (cli.lat, cli.lon) {
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            eprintln!("Error: Invalid coordinates. Lat: -90..90, Lon: -180..180");
            std::process::exit(1);
        }
        let fix = Fix {
            latitude: lat,
            longitude: lon,
            accuracy: cli.accuracy.unwrap_or(f64::INFINITY),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        return resolver.resolve_fix(fix, LocationSource::BrowserGps).await;
    }

    resolver.resolve().await
}

fn load_feed(path: &Path) -> ReplayGeolocation {
    let text = std::fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Error: Cannot read fix feed {}: {}", path.display(), e);
        std::process::exit(1);
    });
    ReplayGeolocation::from_json_lines(&text).unwrap_or_else(|e| {
        eprintln!("Error: Malformed fix feed {}: {}", path.display(), e);
        std::process::exit(1);
    })
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error: Cannot serialize output: {}", e);
            std::process::exit(1);
        }
    }
}

fn fail(e: LocationError) -> ! {
    eprintln!("Error: {}", e);
    let code = match e {
        LocationError::ManualEntryRequired { .. } => {
            eprintln!("  Enter the address with --address/--city/--pincode, or try --search.");
            2
        }
        LocationError::PermissionDenied => {
            eprintln!("  Grant location access and retry, or enter the address manually.");
            3
        }
        _ => 1,
    };
    std::process::exit(code);
}
