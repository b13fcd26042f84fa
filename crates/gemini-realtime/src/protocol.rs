//! Wire types for the Gemini Live `BidiGenerateContent` protocol.
//!
//! Outbound messages are a single externally-keyed JSON envelope
//! (`{"setup": {...}}`, `{"realtimeInput": {...}}`, ...). Inbound frames carry
//! no discriminator, so [`decode`] probes each known shape in a fixed order
//! and the first one that fits wins.

use base64::Engine;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::INPUT_AUDIO_MIME;

// --- Client -> server ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
}

/// A batch of conversation turns, used for initial context and typed input.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

impl ClientContent {
    /// A single text turn spoken by `role` ("user" or "model").
    pub fn text(role: impl Into<String>, text: impl Into<String>, turn_complete: bool) -> Self {
        Self {
            turns: vec![Content::text(role, text)],
            turn_complete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            parts: vec![Part { text: text.into() }],
        }
    }

    /// Content without a role, as expected by `systemInstruction`.
    pub fn instruction(text: impl Into<String>) -> Self {
        Self {
            role: None,
            parts: vec![Part { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    pub data: String,
}

/// Model generation parameters sent with the setup message.
///
/// Well-known fields are typed; anything else the service accepts can be
/// placed in `extra` and is flattened into the same JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<ResponseModality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            response_modalities: vec![ResponseModality::Audio],
            speech_config: None,
            temperature: None,
            extra: Map::new(),
        }
    }
}

impl GenerationConfig {
    pub fn with_voice(mut self, voice_name: impl Into<String>) -> Self {
        self.speech_config = Some(SpeechConfig {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice_name.into(),
                },
            },
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseModality {
    Text,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl ClientMessage {
    /// One chunk of PCM16 microphone audio.
    pub fn audio(pcm: &[u8]) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Some(Blob {
                mime_type: INPUT_AUDIO_MIME.to_string(),
                data: base64::engine::general_purpose::STANDARD.encode(pcm),
            }),
            audio_stream_end: None,
        })
    }

    /// Marks the end of the user's audio turn.
    pub fn audio_stream_end() -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: None,
            audio_stream_end: Some(true),
        })
    }

    /// Serializes the message into a text frame payload.
    ///
    /// # Panics
    ///
    /// Every field is plain data with string keys, so serialization cannot
    /// fail; a failure here is a bug in these types.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("client messages always serialize")
    }
}

// --- Server -> client ---

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    SetupComplete,
    Interrupted,
    /// PCM16 model audio. Empty when the model turn carried no inline data.
    AudioOutput(Bytes),
    TurnComplete,
    InputTranscription(String),
    OutputTranscription(String),
    GoAway { time_left: Option<String> },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetupCompleteFrame {
    #[allow(dead_code)]
    setup_complete: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContentFrame<T> {
    server_content: T,
}

#[derive(Deserialize)]
struct InterruptedContent {
    interrupted: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelTurnContent {
    model_turn: ModelTurn,
}

#[derive(Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ModelPart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelPart {
    inline_data: Option<InlineData>,
}

#[derive(Deserialize)]
struct InlineData {
    data: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TurnCompleteContent {
    turn_complete: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputTranscriptionContent {
    input_transcription: Transcription,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutputTranscriptionContent {
    output_transcription: Transcription,
}

#[derive(Deserialize)]
struct Transcription {
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAwayFrame {
    go_away: GoAway,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoAway {
    time_left: Option<String>,
}

type Probe = fn(&Value) -> Option<ServerEvent>;

/// Probe order is part of the protocol contract: the first match wins.
const PROBES: [Probe; 7] = [
    probe_setup_complete,
    probe_interrupted,
    probe_audio_output,
    probe_turn_complete,
    probe_input_transcription,
    probe_output_transcription,
    probe_go_away,
];

/// Decodes one inbound text frame.
///
/// Returns `None` for frames that are not JSON or match no known shape.
pub fn decode(text: &str) -> Option<ServerEvent> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Inbound frame is not JSON");
            return None;
        }
    };
    PROBES.iter().find_map(|probe| probe(&value))
}

fn probe_setup_complete(value: &Value) -> Option<ServerEvent> {
    SetupCompleteFrame::deserialize(value).ok()?;
    Some(ServerEvent::SetupComplete)
}

fn probe_interrupted(value: &Value) -> Option<ServerEvent> {
    let frame = ServerContentFrame::<InterruptedContent>::deserialize(value).ok()?;
    frame
        .server_content
        .interrupted
        .then_some(ServerEvent::Interrupted)
}

fn probe_audio_output(value: &Value) -> Option<ServerEvent> {
    let frame = ServerContentFrame::<ModelTurnContent>::deserialize(value).ok()?;
    let mut audio = BytesMut::new();
    for data in frame
        .server_content
        .model_turn
        .parts
        .into_iter()
        .filter_map(|part| part.inline_data.and_then(|inline| inline.data))
    {
        match base64::engine::general_purpose::STANDARD.decode(&data) {
            Ok(pcm) => audio.extend_from_slice(&pcm),
            Err(e) => warn!(error = %e, "Skipping model audio part with invalid base64"),
        }
    }
    Some(ServerEvent::AudioOutput(audio.freeze()))
}

fn probe_turn_complete(value: &Value) -> Option<ServerEvent> {
    let frame = ServerContentFrame::<TurnCompleteContent>::deserialize(value).ok()?;
    frame
        .server_content
        .turn_complete
        .then_some(ServerEvent::TurnComplete)
}

fn probe_input_transcription(value: &Value) -> Option<ServerEvent> {
    let frame = ServerContentFrame::<InputTranscriptionContent>::deserialize(value).ok()?;
    Some(ServerEvent::InputTranscription(
        frame.server_content.input_transcription.text,
    ))
}

fn probe_output_transcription(value: &Value) -> Option<ServerEvent> {
    let frame = ServerContentFrame::<OutputTranscriptionContent>::deserialize(value).ok()?;
    Some(ServerEvent::OutputTranscription(
        frame.server_content.output_transcription.text,
    ))
}

fn probe_go_away(value: &Value) -> Option<ServerEvent> {
    let frame = GoAwayFrame::deserialize(value).ok()?;
    Some(ServerEvent::GoAway {
        time_left: frame.go_away.time_left,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_setup_encodes_as_keyed_envelope() {
        let msg = ClientMessage::Setup(Setup {
            model: "models/test".to_string(),
            generation_config: Some(GenerationConfig::default().with_voice("Puck")),
            system_instruction: Some(Content::instruction("be brief")),
        });
        let value: Value = serde_json::from_str(&msg.encode()).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/test",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Puck" } }
                        }
                    },
                    "systemInstruction": { "parts": [{ "text": "be brief" }] }
                }
            })
        );
    }

    #[test]
    fn test_generation_config_flattens_extra_keys() {
        let mut config = GenerationConfig {
            temperature: Some(0.5),
            ..Default::default()
        };
        config.extra.insert("maxOutputTokens".to_string(), json!(256));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["maxOutputTokens"], json!(256));
        assert_eq!(value["temperature"], json!(0.5));
    }

    #[test]
    fn test_audio_message_carries_base64_pcm() {
        let value: Value =
            serde_json::from_str(&ClientMessage::audio(&[1, 2, 3, 4]).encode()).unwrap();
        assert_eq!(
            value,
            json!({
                "realtimeInput": {
                    "audio": { "mimeType": "audio/pcm;rate=16000", "data": b64(&[1, 2, 3, 4]) }
                }
            })
        );
    }

    #[test]
    fn test_audio_stream_end_message() {
        assert_eq!(
            ClientMessage::audio_stream_end().encode(),
            r#"{"realtimeInput":{"audioStreamEnd":true}}"#
        );
    }

    #[test]
    fn test_client_content_text() {
        let msg = ClientMessage::ClientContent(ClientContent::text("user", "hello", true));
        assert_eq!(
            msg.encode(),
            r#"{"clientContent":{"turns":[{"role":"user","parts":[{"text":"hello"}]}],"turnComplete":true}}"#
        );
    }

    #[test]
    fn test_decode_setup_complete() {
        assert_eq!(
            decode(r#"{"setupComplete":{}}"#),
            Some(ServerEvent::SetupComplete)
        );
    }

    #[test]
    fn test_decode_interrupted() {
        assert_eq!(
            decode(r#"{"serverContent":{"interrupted":true}}"#),
            Some(ServerEvent::Interrupted)
        );
        assert_eq!(decode(r#"{"serverContent":{"interrupted":false}}"#), None);
    }

    #[test]
    fn test_decode_audio_concatenates_parts() {
        let frame = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": b64(&[1, 2]) } },
                        { "text": "ignored" },
                        { "inlineData": { "data": b64(&[3, 4]) } }
                    ]
                }
            }
        });
        assert_eq!(
            decode(&frame.to_string()),
            Some(ServerEvent::AudioOutput(Bytes::from_static(&[1, 2, 3, 4])))
        );
    }

    #[test]
    fn test_decode_audio_without_data_yields_empty() {
        let frame = r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{}}]}}}"#;
        assert_eq!(decode(frame), Some(ServerEvent::AudioOutput(Bytes::new())));
    }

    #[test]
    fn test_decode_audio_skips_malformed_base64() {
        let frame = json!({
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        { "inlineData": { "data": "%%%not-base64%%%" } },
                        { "inlineData": { "data": b64(&[9, 9]) } }
                    ]
                }
            }
        });
        assert_eq!(
            decode(&frame.to_string()),
            Some(ServerEvent::AudioOutput(Bytes::from_static(&[9, 9])))
        );
    }

    #[test]
    fn test_decode_turn_complete_and_transcriptions() {
        assert_eq!(
            decode(r#"{"serverContent":{"turnComplete":true}}"#),
            Some(ServerEvent::TurnComplete)
        );
        assert_eq!(
            decode(r#"{"serverContent":{"inputTranscription":{"text":"hi there"}}}"#),
            Some(ServerEvent::InputTranscription("hi there".to_string()))
        );
        assert_eq!(
            decode(r#"{"serverContent":{"outputTranscription":{"text":"hello"}}}"#),
            Some(ServerEvent::OutputTranscription("hello".to_string()))
        );
    }

    #[test]
    fn test_decode_go_away() {
        assert_eq!(
            decode(r#"{"goAway":{"timeLeft":"5s"}}"#),
            Some(ServerEvent::GoAway {
                time_left: Some("5s".to_string())
            })
        );
    }

    #[test]
    fn test_probe_order_prefers_interruption_over_audio() {
        let frame = json!({
            "serverContent": {
                "interrupted": true,
                "modelTurn": { "parts": [{ "inlineData": { "data": b64(&[1]) } }] }
            }
        });
        assert_eq!(decode(&frame.to_string()), Some(ServerEvent::Interrupted));
    }

    #[test]
    fn test_unknown_and_invalid_frames_are_ignored() {
        assert_eq!(decode(r#"{"usageMetadata":{"totalTokenCount":12}}"#), None);
        assert_eq!(decode(r#"{"serverContent":{}}"#), None);
        assert_eq!(decode("not json at all"), None);
        assert_eq!(decode("[]"), None);
    }
}
