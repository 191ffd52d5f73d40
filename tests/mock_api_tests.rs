//! Mock engine tests for the pipeline's pluggable backends.
//!
//! These validate each mock's own contract (it satisfies the trait's
//! input/output shape) in isolation, without driving a full task through
//! the `Executor`. End-to-end behavior lives in `integration_tests.rs`.

mod common;

use common::{word, MockAudioExtractor, MockMuxer, MockTranscriber, MockTranslator, MockVoiceCloner};
use dubwright::engines::{AudioExtractorEngine, MuxerEngine, TranscriberEngine, TranslatorEngine, VoiceClonerEngine};
use tempfile::TempDir;

mod audio_extractor_tests {
    use super::*;

    #[tokio::test]
    async fn test_extract_writes_requested_duration() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("audio.wav");
        let extractor = MockAudioExtractor { duration_s: 3.5 };

        let duration = extractor.extract(dir.path().join("ignored.mp4").as_path(), &dest).await.unwrap();

        assert_eq!(duration, 3.5);
        let reader = hound::WavReader::open(&dest).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, common::SAMPLE_RATE);
        let got_duration = reader.duration() as f64 / spec.sample_rate as f64;
        assert!((got_duration - 3.5).abs() < 0.01);
    }
}

mod transcriber_tests {
    use super::*;

    #[tokio::test]
    async fn test_transcribe_returns_configured_segments_regardless_of_input() {
        let transcriber = MockTranscriber {
            language: "en".to_string(),
            segments: vec![dubwright::engines::TranscribedSegment {
                start: 0.0,
                end: 1.0,
                text: "hi".to_string(),
                words: Some(vec![word("hi", 0.0, 1.0)]),
            }],
        };

        let result = transcriber.transcribe(std::path::Path::new("/nonexistent.wav"), Some("en")).await.unwrap();

        assert_eq!(result.language, "en");
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].text, "hi");
    }
}

mod translator_tests {
    use super::*;

    #[tokio::test]
    async fn test_succeeding_translator_prefixes_target_lang() {
        let translator = MockTranslator::succeeding();
        let out = translator.translate(&["hello".to_string()], "en", "es").await.unwrap();
        assert_eq!(out, vec!["[es] hello".to_string()]);
        assert_eq!(translator.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_translator_always_errors() {
        let translator = MockTranslator::always_failing();
        let out = translator.translate(&["hello".to_string()], "en", "es").await;
        assert!(out.is_err());
    }
}

mod voice_cloner_tests {
    use super::*;

    #[tokio::test]
    async fn test_clone_scales_reference_duration_by_multiplier() {
        let dir = TempDir::new().unwrap();
        let reference = dir.path().join("ref.wav");
        common::write_silence_wav(&reference, 2.0);

        let cloner = MockVoiceCloner { duration_multiplier: 1.5 };
        let dest = dir.path().join("cloned.wav");
        let duration = cloner.clone(&reference, "hola", &dest).await.unwrap();

        assert!((duration - 3.0).abs() < 0.01);
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_clone_falls_back_to_one_second_when_reference_missing() {
        let dir = TempDir::new().unwrap();
        let cloner = MockVoiceCloner { duration_multiplier: 1.0 };
        let dest = dir.path().join("cloned.wav");
        let duration = cloner.clone(std::path::Path::new("/nonexistent.wav"), "x", &dest).await.unwrap();
        assert!((duration - 1.0).abs() < 0.01);
    }
}

mod muxer_tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_mux_copies_voice_track_to_dest_and_records_the_call() {
        let dir = TempDir::new().unwrap();
        let voice = dir.path().join("voice.wav");
        common::write_silence_wav(&voice, 1.0);
        let dest = dir.path().join("out.mp4");

        let muxer = MockMuxer::new();
        muxer.mux(std::path::Path::new("/source.mp4"), &voice, None, &dest).await.unwrap();

        assert!(muxer.called.load(Ordering::SeqCst));
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), tokio::fs::read(&voice).await.unwrap());
    }
}
