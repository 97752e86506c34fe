use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serenity::model::id::GuildId;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

use crate::error::Result;

/// Configuración de reproducción por servidor, almacenada en JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuildSettings {
    pub guild_id: u64,
    /// Máximo de canciones aceptadas de una playlist
    pub playlist_limit: usize,
    pub max_queue_size: usize,
    /// 0..=100
    pub default_volume: u8,
    pub duck_enabled: bool,
    /// Volumen objetivo mientras alguien habla (0..=100)
    pub duck_volume: u8,
    pub queue_page_size: usize,
    pub auto_announce: bool,
    /// Segundos en idle antes de emitir `IdleTimeout` (0 = nunca)
    pub idle_disconnect_secs: u64,
}

impl Default for GuildSettings {
    fn default() -> Self {
        Self {
            guild_id: 0,
            playlist_limit: 50,
            max_queue_size: 1000,
            default_volume: 50,
            duck_enabled: true,
            duck_volume: 20,
            queue_page_size: 10,
            auto_announce: false,
            idle_disconnect_secs: 300,
        }
    }
}

impl GuildSettings {
    pub fn for_guild(guild_id: GuildId) -> Self {
        Self {
            guild_id: guild_id.get(),
            ..Self::default()
        }
    }

    /// Recorta valores fuera de rango que pudieran venir del archivo
    fn sanitized(mut self) -> Self {
        self.default_volume = self.default_volume.min(100);
        self.duck_volume = self.duck_volume.min(100);
        self.queue_page_size = self.queue_page_size.max(1);
        self.max_queue_size = self.max_queue_size.clamp(1, 10_000);
        self
    }
}

/// Read-only view of per-guild settings.
///
/// Sessions call this on every command instead of holding a copy, so edits
/// made by the command layer apply to the next command.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn guild_settings(&self, guild_id: GuildId) -> GuildSettings;
}

/// Los mismos ajustes para todos los servidores
#[async_trait]
impl SettingsProvider for GuildSettings {
    async fn guild_settings(&self, guild_id: GuildId) -> GuildSettings {
        GuildSettings {
            guild_id: guild_id.get(),
            ..self.clone()
        }
    }
}

/// Manager de almacenamiento basado en archivos JSON
pub struct JsonStorage {
    data_dir: PathBuf,
    servers_cache: RwLock<HashMap<u64, GuildSettings>>,
}

impl JsonStorage {
    pub async fn new(data_dir: PathBuf) -> Result<Self> {
        let servers_dir = data_dir.join("servers");
        fs::create_dir_all(&servers_dir).await?;

        info!("📁 Storage inicializado en: {}", data_dir.display());

        let storage = Self {
            data_dir,
            servers_cache: RwLock::new(HashMap::new()),
        };

        storage.load_all_servers().await?;

        Ok(storage)
    }

    /// Obtiene la configuración de un servidor (por defecto si no existe)
    pub async fn get_guild_settings(&self, guild_id: GuildId) -> GuildSettings {
        let cached = self.servers_cache.read().get(&guild_id.get()).cloned();
        if let Some(settings) = cached {
            return settings;
        }

        match self.load_guild_settings(guild_id.get()).await {
            Ok(settings) => {
                self.servers_cache
                    .write()
                    .insert(guild_id.get(), settings.clone());
                settings
            }
            Err(_) => GuildSettings::for_guild(guild_id),
        }
    }

    /// Actualiza la configuración de un servidor
    pub async fn update_guild_settings(&self, settings: GuildSettings) -> Result<()> {
        let settings = settings.sanitized();
        let guild_id = settings.guild_id;

        self.save_guild_settings(&settings).await?;
        self.servers_cache.write().insert(guild_id, settings);

        info!("💾 Configuración actualizada para guild {}", guild_id);
        Ok(())
    }

    // Métodos privados

    async fn load_guild_settings(&self, guild_id: u64) -> Result<GuildSettings> {
        let content = fs::read_to_string(self.get_server_file_path(guild_id)).await?;
        let settings: GuildSettings = serde_json::from_str(&content)?;
        Ok(GuildSettings {
            guild_id,
            ..settings.sanitized()
        })
    }

    async fn save_guild_settings(&self, settings: &GuildSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.get_server_file_path(settings.guild_id), content).await?;
        Ok(())
    }

    async fn load_all_servers(&self) -> Result<()> {
        let servers_dir = self.data_dir.join("servers");
        let mut files = fs::read_dir(&servers_dir).await?;
        let mut loaded_count = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let Some(guild_id) = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("guild_"))
                .and_then(|id| id.parse::<u64>().ok())
            else {
                continue;
            };

            match self.load_guild_settings(guild_id).await {
                Ok(settings) => {
                    self.servers_cache.write().insert(guild_id, settings);
                    loaded_count += 1;
                }
                Err(e) => {
                    warn!("Error cargando configuración para guild {}: {}", guild_id, e);
                }
            }
        }

        if loaded_count > 0 {
            info!("📂 Cargadas {} configuraciones de servidor", loaded_count);
        }

        Ok(())
    }

    fn get_server_file_path(&self, guild_id: u64) -> PathBuf {
        self.data_dir
            .join("servers")
            .join(format!("guild_{}.json", guild_id))
    }
}

#[async_trait]
impl SettingsProvider for JsonStorage {
    async fn guild_settings(&self, guild_id: GuildId) -> GuildSettings {
        self.get_guild_settings(guild_id).await
    }
}
