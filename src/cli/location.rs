//! Location subcommands.
//!
//! - `add`: register a location and create its package
//! - `list`: all locations with their last integrity status
//! - `show`: details, package summary and recent media
//! - `update`: change descriptive fields (rewrites package-info)

use anyhow::Result;
use clap::Subcommand;

use super::parse_location_id;
use crate::config::ResolvedConfig;
use crate::domain::Location;
use crate::package::manifest::read_info;
use crate::vault::Vault;

/// Location-related subcommands
#[derive(Subcommand, Debug)]
pub enum LocationCommands {
    /// Register a new location
    Add {
        /// Location name
        name: String,

        /// Distinguishes two locations with the same name
        #[arg(long)]
        disambiguator: Option<String>,

        /// Latitude in decimal degrees
        #[arg(long, requires = "longitude", allow_hyphen_values = true)]
        latitude: Option<f64>,

        /// Longitude in decimal degrees
        #[arg(long, requires = "latitude", allow_hyphen_values = true)]
        longitude: Option<f64>,

        /// Street address
        #[arg(long)]
        address: Option<String>,

        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },

    /// List locations
    List,

    /// Show a location
    Show {
        /// Location ID
        location_id: String,

        /// Maximum number of media files to list
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Update descriptive fields of a location
    Update {
        /// Location ID
        location_id: String,

        /// New name (the id stays the same)
        #[arg(long)]
        name: Option<String>,

        /// Street address
        #[arg(long)]
        address: Option<String>,

        /// Free-form notes
        #[arg(long)]
        notes: Option<String>,
    },
}

/// Execute location subcommands
pub async fn execute(command: LocationCommands, cfg: &ResolvedConfig) -> Result<()> {
    let vault = Vault::open(cfg)?;

    match command {
        LocationCommands::Add {
            name,
            disambiguator,
            latitude,
            longitude,
            address,
            notes,
        } => {
            if name.trim().is_empty() {
                anyhow::bail!("Location name cannot be empty");
            }

            let mut location = Location::new(name, vault.archive_root());
            if let Some(d) = disambiguator {
                location = location.with_disambiguator(vault.archive_root(), &d);
            }
            if let (Some(lat), Some(lon)) = (latitude, longitude) {
                location = location.with_geo(lat, lon);
            }
            if let Some(address) = address {
                location = location.with_address(address);
            }
            if let Some(notes) = notes {
                location = location.with_notes(notes);
            }

            let location = vault.add_location(location).await?;
            println!("Added location {} ({})", location.name, location.id);
            println!("Root: {}", location.root.display());
            Ok(())
        }

        LocationCommands::List => {
            let locations = vault.locations().await?;
            if locations.is_empty() {
                println!("No locations. Add one with: locvault location add <name>");
                return Ok(());
            }

            println!("{:<18} {:<30} {:<12} {}", "ID", "NAME", "STATUS", "LAST CHECK");
            println!("{}", "-".repeat(85));
            for location in locations {
                let (status, checked) = match vault.status(&location.id).await? {
                    Some(r) => (
                        r.status.to_string(),
                        r.checked_at.format("%Y-%m-%d %H:%M").to_string(),
                    ),
                    None => ("-".to_string(), "never".to_string()),
                };
                let name = if location.name.chars().count() > 28 {
                    format!("{}...", location.name.chars().take(25).collect::<String>())
                } else {
                    location.name.clone()
                };
                println!("{:<18} {:<30} {:<12} {}", location.id, name, status, checked);
            }
            Ok(())
        }

        LocationCommands::Show { location_id, limit } => {
            let id = parse_location_id(&location_id)?;
            let location = vault.location(&id).await?;

            println!("ID: {}", location.id);
            println!("Name: {}", location.name);
            println!("Root: {}", location.root.display());
            if let Some(geo) = &location.geo {
                println!("Coordinates: {}, {}", geo.latitude, geo.longitude);
            }
            if let Some(address) = &location.address {
                println!("Address: {}", address);
            }
            if let Some(notes) = &location.notes {
                println!("Notes: {}", notes);
            }
            println!("Created: {}", location.created_at.format("%Y-%m-%d %H:%M:%S UTC"));

            match read_info(&location).await? {
                Some(info) => println!("Payload-Oxum: {}", info.payload_oxum),
                None => println!("Package: (not created)"),
            }

            let media = vault.media(&id).await?;
            println!("\nMedia ({} files):", media.len());
            for record in media.iter().take(limit) {
                println!(
                    "  {}  {:<9} {:>12}  {}",
                    record.digest.short(),
                    record.category,
                    record.size,
                    record.original_name
                );
            }
            if media.len() > limit {
                println!("  ... and {} more", media.len() - limit);
            }
            Ok(())
        }

        LocationCommands::Update {
            location_id,
            name,
            address,
            notes,
        } => {
            let id = parse_location_id(&location_id)?;
            let mut location = vault.location(&id).await?;

            if let Some(name) = name {
                location.name = name;
            }
            if let Some(address) = address {
                location.address = Some(address);
            }
            if let Some(notes) = notes {
                location.notes = Some(notes);
            }

            vault.update_location(&location).await?;
            println!("Updated location {}", location.id);
            Ok(())
        }
    }
}
