//! Runtime pieces of the `parley` binary: configuration, audio helpers and
//! the audio device backends the session transport runs on.

pub mod audio_utils;
pub mod config;
pub mod file_devices;
#[cfg(feature = "native-audio")]
pub mod native;
