use std::{env, path::PathBuf, sync::Arc, time::Duration};

use chat_core::{ChatEvent, RoomCommand, RoomTuning, spawn_room};
use chat_platform::{JsonFileStore, KeyValueStore, LocalPrefs};
use chat_supabase::{SupabaseBackend, SupabaseConfig};
use tracing::{info, warn};

mod logging;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SupabaseConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {err}");
            eprintln!("Required: CALCVAULT_SUPABASE_URL and CALCVAULT_SUPABASE_ANON_KEY");
            std::process::exit(1);
        }
    };

    let data_dir = env::var("CALCVAULT_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.calcvault-smoke-store"));
    let prefs = LocalPrefs::new(JsonFileStore::new(data_dir.join("prefs.json")));

    let user_id = env::var("CALCVAULT_USER")
        .ok()
        .or_else(|| prefs.display_name().ok())
        .unwrap_or_else(|| "smoke-user".to_owned());
    if let Err(err) = prefs.set_display_name(&user_id) {
        warn!("could not persist display name: {err}");
    }
    info!(room_id = %config.room_id, %user_id, "starting room runtime");

    let backend = Arc::new(SupabaseBackend::new(config));
    let handle = spawn_room(backend, user_id, RoomTuning::default());
    let mut events = handle.subscribe();

    if handle.send(RoomCommand::LoadInitial).await.is_err() {
        eprintln!("Runtime exited before the initial load");
        std::process::exit(1);
    }

    // Print a short window of activity, then shut down cleanly.
    let window = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match events.recv().await {
                Ok(ChatEvent::ConversationUpdated { messages }) => {
                    println!("conversation: {} message(s)", messages.len());
                    for message in messages.iter().take(5) {
                        println!("  [{}] {}: {}", message.created_at, message.user_id, message.text);
                    }
                }
                Ok(ChatEvent::TypingChanged { user_ids }) => {
                    println!("typing: {user_ids:?}");
                }
                Ok(ChatEvent::OnlineChanged { user_ids }) => {
                    println!("online: {user_ids:?}");
                }
                Ok(ChatEvent::ReadFailed { error }) => {
                    eprintln!("read failed: {error}");
                    break;
                }
                Ok(ChatEvent::Loading { active: false }) => {
                    println!("initial load settled");
                }
                Ok(ChatEvent::PanicCompleted) => {
                    println!("panic triggered, wiping local data");
                    wipe_local_data(&prefs);
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
    .await;

    if window.is_err() {
        println!("smoke window elapsed");
    }
    let _ = handle.send(RoomCommand::Shutdown).await;
}

/// The in-room wipe clears chat state; this clears what lives on disk.
fn wipe_local_data<S: KeyValueStore>(prefs: &LocalPrefs<S>) {
    match prefs.wipe() {
        Ok(()) => info!("local preferences wiped"),
        Err(err) => warn!("local wipe failed: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use chat_platform::{InMemoryKeyValueStore, StoreError};

    use super::*;

    #[test]
    fn panic_wipe_clears_stored_prefs() {
        let prefs = LocalPrefs::new(InMemoryKeyValueStore::default());
        prefs.set_display_name("smoke-user").expect("set name");

        wipe_local_data(&prefs);
        assert!(matches!(prefs.display_name(), Err(StoreError::NotFound)));

        // A second wipe over an already-empty store stays quiet.
        wipe_local_data(&prefs);
    }
}
