//! Audio challenge pipeline: download, transcode, speech-to-text.
//!
//! The challenge asset arrives as compressed audio (mp3); the transcription
//! service wants wav. Decoding goes through symphonia, the wav is written
//! with hound, and the text comes back from an OpenAI-compatible
//! `/audio/transcriptions` endpoint. All intermediate files live under the
//! worker's downloads path and are removed by [`TempArtifacts`] no matter
//! how the solve attempt ends.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::core::config::TranscribeSettings;

/// Scope guard for challenge temp files. Dropping it removes every tracked
/// path; removal failure is logged, never raised.
#[derive(Default)]
pub struct TempArtifacts {
    paths: Vec<PathBuf>,
}

impl TempArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: PathBuf) -> PathBuf {
        self.paths.push(path.clone());
        path
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("deleted temp file: {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("error deleting temp file {}: {e}", path.display()),
            }
        }
    }
}

/// Fetch the challenge audio asset to `dest`.
pub async fn download_audio(http: &reqwest::Client, link: &str, dest: &Path) -> Result<()> {
    let response = http
        .get(link)
        .send()
        .await
        .with_context(|| format!("audio download request failed: {link}"))?
        .error_for_status()
        .context("audio download returned an error status")?;
    let bytes = response.bytes().await?;
    tokio::fs::write(dest, &bytes)
        .await
        .with_context(|| format!("cannot write audio file {}", dest.display()))?;
    Ok(())
}

/// Decode the downloaded asset and rewrite it as 16-bit PCM wav.
pub fn transcode_to_wav(src: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(src)
        .with_context(|| format!("cannot open audio file {}", src.display()))?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = src.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("unrecognized audio container")?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow!("no audio track in {}", src.display()))?;
    let track_id = track.id;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(16_000);
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("no decoder for audio track")?;

    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(dest, spec)
        .with_context(|| format!("cannot create wav file {}", dest.display()))?;

    let mut sample_buf: Option<SampleBuffer<i16>> = None;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(e.into()),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(decoded) => {
                if sample_buf.is_none() {
                    sample_buf = Some(SampleBuffer::new(
                        decoded.capacity() as u64,
                        *decoded.spec(),
                    ));
                }
                if let Some(buf) = sample_buf.as_mut() {
                    buf.copy_interleaved_ref(decoded);
                    for &sample in buf.samples() {
                        writer.write_sample(sample)?;
                    }
                }
            }
            // Corrupt packets are skippable; the transcriber copes with gaps.
            Err(symphonia::core::errors::Error::DecodeError(e)) => {
                debug!("skipping undecodable packet: {e}");
            }
            Err(e) => return Err(e.into()),
        }
    }
    writer.finalize()?;
    Ok(())
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Send the wav to the transcription endpoint and return the decoded text.
pub async fn speech_to_text(
    http: &reqwest::Client,
    settings: &TranscribeSettings,
    wav_path: &Path,
) -> Result<String> {
    let bytes = tokio::fs::read(wav_path)
        .await
        .with_context(|| format!("cannot read wav file {}", wav_path.display()))?;
    let part = reqwest::multipart::Part::bytes(bytes)
        .file_name("audio.wav")
        .mime_str("audio/wav")?;
    let form = reqwest::multipart::Form::new()
        .part("file", part)
        .text("model", settings.model.clone());

    let mut request = http
        .post(format!("{}/audio/transcriptions", settings.base_url))
        .multipart(form);
    if let Some(key) = &settings.api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send().await.context("transcription request failed")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("transcription service returned {status}: {body}"));
    }

    let parsed: TranscriptionResponse = response.json().await?;
    Ok(parsed.text.trim().to_string())
}
