use serenity::model::id::UserId;
use std::collections::HashSet;
use tracing::debug;

/// Volumen máximo aceptado por la sesión
pub const MAX_VOLUME: u8 = 100;

/// Volumen que recibe el sink: el de la sesión, o el de ducking si es menor
pub fn effective_volume(volume: u8, duck_active: bool, duck_volume: u8) -> u8 {
    let volume = volume.min(MAX_VOLUME);
    if duck_active {
        volume.min(duck_volume)
    } else {
        volume
    }
}

/// Usuarios hablando en el canal de voz del servidor.
///
/// Ducking stays active while at least one user is speaking.
#[derive(Debug, Default)]
pub struct DuckTracker {
    speaking: HashSet<UserId>,
}

impl DuckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra actividad de voz; devuelve `true` si hay alguien hablando
    pub fn update(&mut self, user_id: UserId, speaking: bool) -> bool {
        let changed = if speaking {
            self.speaking.insert(user_id)
        } else {
            self.speaking.remove(&user_id)
        };
        if changed {
            debug!(
                "🎙️ {} {} ({} hablando)",
                user_id,
                if speaking { "habla" } else { "calla" },
                self.speaking.len()
            );
        }
        self.is_active()
    }

    pub fn is_active(&self) -> bool {
        !self.speaking.is_empty()
    }

    pub fn clear(&mut self) {
        self.speaking.clear();
    }
}
