//! Channel listing.

use serde::Serialize;
use tabled::Tabled;
use uuid::Uuid;
use wizlink_config::Config;
use wizlink_gatt::IntWidth;

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

/// A configured channel with its position in snapshot order.
#[derive(Debug, Serialize)]
struct ChannelInfo {
    index: usize,
    name: String,
    uuid: Uuid,
    width: IntWidth,
}

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct ChannelRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "UUID")]
    uuid: String,
    #[tabled(rename = "Width")]
    width: String,
}

impl From<&ChannelInfo> for ChannelRow {
    fn from(c: &ChannelInfo) -> Self {
        Self {
            index: c.index,
            name: c.name.clone(),
            uuid: c.uuid.to_string(),
            width: format!("{} ({} bytes)", c.width, c.width.bytes()),
        }
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(config: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let service = config.to_service_config()?;

    let channels: Vec<ChannelInfo> = service
        .channels
        .into_iter()
        .enumerate()
        .map(|(index, c)| ChannelInfo {
            index,
            name: c.name,
            uuid: c.uuid,
            width: c.width,
        })
        .collect();

    let out = output::render_list(
        &global.output,
        &channels,
        |c| ChannelRow::from(c),
        |c| c.name.clone(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}
