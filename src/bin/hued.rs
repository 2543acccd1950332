use hue_groups::*;
use std::io::{self, BufRead};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only replies
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("hue_groups=warn")),
        )
        .with_writer(io::stderr)
        .compact()
        .init();

    // Optional database path; the per-user default otherwise
    let usage = "Usage: hued [database path]";
    let args: Vec<_> = std::env::args().collect();
    if args.len() > 1 && (args[1] == "-h" || args[1] == "--help") {
        eprintln!("{usage}");
        std::process::exit(0);
    }
    let config = args
        .get(1)
        .map(|path| StoreConfig::new(PathBuf::from(path)))
        .unwrap_or_default();

    let store = GroupStore::open(&config)?;
    store.initialize()?;
    println!("OK");

    // Mainloop: one command per line, `name` or `name:arg,arg,...`
    let mut stdin = io::stdin().lock();
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if stdin.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        // Invalid UTF-8 still gets a reply instead of ending the session
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match handle(&store, line) {
            Ok(Some(reply)) => println!("OK {reply}"),
            Ok(None) => println!("OK"),
            Err(e) => println!("ERR {e}"),
        }
    }
    Ok(())
}

/// Runs one command line against the store, returning a JSON reply if it has one
fn handle(store: &GroupStore, line: &str) -> Result<Option<String>> {
    let (command, rest) = line.split_once(':').unwrap_or((line, ""));
    let args: Vec<&str> = if rest.is_empty() {
        Vec::new()
    } else {
        rest.split(',').map(str::trim).collect()
    };

    match (command.trim(), args.as_slice()) {
        ("init", []) => store.initialize()?,
        ("add_group", [name]) => {
            store.add_group(name)?;
        }
        ("add_light", [name, base_id]) => store.add_light(name, parse_id(base_id)?)?,
        ("assign", [name, base_id, group]) => {
            store.add_light_to_group(name, parse_id(base_id)?, group)?
        }
        ("nest", [child, parent]) => store.add_group_to_group(child, parent)?,
        ("check", [light, group]) => {
            return Ok(Some(serde_json::to_string(&store.get_light_in_group(light, group)?)?))
        }
        ("lights", []) => return Ok(Some(serde_json::to_string(&store.get_lights()?)?)),
        ("lights", [group]) => {
            return Ok(Some(serde_json::to_string(&store.get_lights_in_group(group)?)?))
        }
        ("groups", []) => return Ok(Some(serde_json::to_string(&store.get_groups()?)?)),
        ("purge", []) => store.purge()?,
        (other, _) => {
            return Err(Error::InvalidCommand(other.to_string()))
        }
    }
    Ok(None)
}

fn parse_id(raw: &str) -> Result<i64> {
    raw.parse()
        .map_err(|_| Error::InvalidLightId(raw.to_string()))
}
