pub mod state;

pub use state::{
    AppSettings, CompletionSettings, SettingsError, SettingsStore, StorageBackend,
    StorageSettings,
};
