//! Réglages persistés du lecteur.
//!
//! Le moteur ne lit jamais ce fichier lui-même : le contexte de contrôle
//! écrit chaque changement et pousse les valeurs au lecteur.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerSettings {
    pub player_volume: u8,
    pub player_muted: bool,
    pub static_delay_ms: f64,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            player_volume: 25,
            player_muted: false,
            static_delay_ms: 0.0,
        }
    }
}

impl PlayerSettings {
    /// Charge depuis un fichier JSON ; fichier absent ou invalide → valeurs
    /// par défaut.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Self>(&content) {
                Ok(mut settings) => {
                    settings.player_volume = settings.player_volume.min(100);
                    tracing::debug!(
                        volume = settings.player_volume,
                        muted = settings.player_muted,
                        "loaded player settings"
                    );
                    settings
                }
                Err(err) => {
                    tracing::warn!("invalid settings file {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("could not read settings file {}: {err}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, json)
    }

    pub fn set_volume(&mut self, volume: u8) {
        self.player_volume = volume.min(100);
    }
}
