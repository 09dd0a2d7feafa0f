//! Print a complete example configuration to stdout.

use ao_loop::config::{
    BufferConfig, CalibPathsConfig, LoopConfig, LogsConfig, SensorConfig, ServerConfig, SimConfig,
    TrackMethod,
};
use ao_types::{GainSettings, WfcConfig, WfcKind};

fn main() {
    let cfg = LoopConfig {
        sensor: SensorConfig {
            name: "SH WFS".to_string(),
            width: 256,
            height: 256,
            bpp: 8,
            field_frames: 1000,
            scan: ao_types::ScanAxes::Xy,
            cells: (8, 8),
            track: (16, 16),
            samini: 20.0,
            samxr: 0,
        },
        wfc: vec![
            WfcConfig {
                name: "TT".to_string(),
                kind: WfcKind::TipTilt,
                nact: 2,
                gain: GainSettings::default(),
                calrange: (-1.0, 1.0),
                step_field: Default::default(),
            },
            WfcConfig {
                name: "Okotech DM".to_string(),
                kind: WfcKind::DeformableMirror,
                nact: 37,
                gain: GainSettings::default(),
                calrange: (-1.0, 1.0),
                step_field: Default::default(),
            },
        ],
        server: ServerConfig::default(),
        calib: CalibPathsConfig::default(),
        logs: LogsConfig::default(),
        buffer: BufferConfig::default(),
        sim: SimConfig::default(),
        tracking: TrackMethod::Cog,
        log_fraction: 100,
    };
    println!("{}", toml::to_string_pretty(&cfg).expect("config serialises"));
}
