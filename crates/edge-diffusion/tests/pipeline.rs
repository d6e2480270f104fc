//! End-to-end pipeline tests with deterministic stub models.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use burn::prelude::*;
use burn::tensor::Int;
use burn_ndarray::NdArray;
use edge_diffusion::clip::ClipTokenizer;
use edge_diffusion::{
    BackendError, CancellationToken, DecoderSession, DenoiserSession, Generation, LatentSource,
    ModelKind, ModelSessions, PipelineError, Progress, SampleConfig, StableDiffusion,
    TextEncoderSession, LATENT_SHAPE,
};

type TestBackend = NdArray<f32>;

const HIDDEN_DIM: usize = 8;

const VOCAB: &str = r#"{
    "a</w>": 320,
    "of</w>": 539,
    "photo</w>": 1125,
    "cat</w>": 2368,
    "<|startoftext|>": 49406,
    "<|endoftext|>": 49407
}"#;

const MERGES: &str = "#version: 0.2\np h\no t\nph ot\nphot o</w>\no f</w>\nc a\nca t</w>\n";

#[derive(Default)]
struct Counters {
    opened: AtomicUsize,
    dropped: AtomicUsize,
    denoiser_calls: AtomicUsize,
}

struct SessionGuard(Arc<Counters>);

impl SessionGuard {
    fn open(counters: &Arc<Counters>) -> Self {
        counters.opened.fetch_add(1, Ordering::SeqCst);
        Self(counters.clone())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

struct StubEncoder(SessionGuard);

impl TextEncoderSession<TestBackend> for StubEncoder {
    fn encode(
        &mut self,
        input_ids: Tensor<TestBackend, 2, Int>,
    ) -> Result<Tensor<TestBackend, 3>, BackendError> {
        let embeddings = (input_ids.float() / 49408.0)
            .unsqueeze_dim::<3>(2)
            .repeat_dim(2, HIDDEN_DIM);
        Ok(embeddings)
    }
}

struct StubDenoiser {
    guard: SessionGuard,
    drop_batch: bool,
}

impl DenoiserSession<TestBackend> for StubDenoiser {
    fn predict_noise(
        &mut self,
        sample: Tensor<TestBackend, 4>,
        timestep: i64,
        encoder_hidden_states: Tensor<TestBackend, 3>,
    ) -> Result<Tensor<TestBackend, 4>, BackendError> {
        self.guard.0.denoiser_calls.fetch_add(1, Ordering::SeqCst);
        if self.drop_batch {
            return Ok(sample.narrow(0, 0, 1));
        }

        let [b, c, h, w] = sample.dims();
        let text = encoder_hidden_states
            .mean_dim(2)
            .mean_dim(1)
            .reshape([b, 1, 1, 1])
            .expand([b, c, h, w]);
        Ok(sample * 0.1 + text * (timestep as f32 / 1000.0))
    }
}

struct StubDecoder(SessionGuard);

impl DecoderSession<TestBackend> for StubDecoder {
    fn decode(
        &mut self,
        latent: Tensor<TestBackend, 4>,
    ) -> Result<Tensor<TestBackend, 4>, BackendError> {
        Ok(latent.narrow(1, 0, 3).tanh())
    }
}

#[derive(Default)]
struct StubSessions {
    counters: Arc<Counters>,
    missing: Option<ModelKind>,
    drop_batch: bool,
}

impl StubSessions {
    fn check(&self, model: ModelKind) -> Result<(), BackendError> {
        if self.missing == Some(model) {
            return Err(BackendError::NotFound {
                model,
                detail: "stub artifact missing".to_string(),
            });
        }
        Ok(())
    }
}

impl ModelSessions<TestBackend> for StubSessions {
    type TextEncoder = StubEncoder;
    type Denoiser = StubDenoiser;
    type Decoder = StubDecoder;

    fn open_text_encoder(&self) -> Result<StubEncoder, BackendError> {
        self.check(ModelKind::TextEncoder)?;
        Ok(StubEncoder(SessionGuard::open(&self.counters)))
    }

    fn open_denoiser(&self) -> Result<StubDenoiser, BackendError> {
        self.check(ModelKind::Denoiser)?;
        Ok(StubDenoiser {
            guard: SessionGuard::open(&self.counters),
            drop_batch: self.drop_batch,
        })
    }

    fn open_decoder(&self) -> Result<StubDecoder, BackendError> {
        self.check(ModelKind::Decoder)?;
        Ok(StubDecoder(SessionGuard::open(&self.counters)))
    }
}

fn pipeline(sessions: StubSessions) -> StableDiffusion<TestBackend, StubSessions> {
    let tokenizer = ClipTokenizer::from_strs(VOCAB, MERGES).unwrap();
    StableDiffusion::new(tokenizer, sessions, &Default::default())
}

fn config(steps: usize) -> SampleConfig {
    SampleConfig {
        steps,
        latent: LatentSource::Seed(42),
        ..Default::default()
    }
}

#[test]
fn test_encode_prompt_shape() {
    let pipeline = pipeline(StubSessions::default());
    let embeddings = pipeline
        .encode_prompt("a photo of a cat", "", &config(5))
        .unwrap();
    assert_eq!(embeddings.dims(), [2, 77, HIDDEN_DIM]);

    // Unconditional half comes first: "" encodes as [bos, eos, pad...]
    let values = embeddings.into_data().to_vec::<f32>().unwrap();
    let bos = 49406.0 / 49408.0;
    let eos = 49407.0 / 49408.0;
    assert!((values[0] - bos).abs() < 1e-6);
    assert!((values[HIDDEN_DIM] - eos).abs() < 1e-6);

    let cond = &values[77 * HIDDEN_DIM..];
    assert!((cond[HIDDEN_DIM] - 320.0 / 49408.0).abs() < 1e-6);
}

#[test]
fn test_progress_sequence() {
    let pipeline = pipeline(StubSessions::default());
    let mut events = Vec::new();
    let result = pipeline
        .text_to_image(
            "a photo of a cat",
            "",
            &config(5),
            |p| events.push(p),
            &CancellationToken::new(),
        )
        .unwrap();
    assert!(!result.is_cancelled());

    let expected_timesteps = [801, 601, 601, 401, 201];
    assert_eq!(events.len(), 6);
    for (i, event) in events.iter().take(5).enumerate() {
        assert_eq!(
            *event,
            Progress::Step {
                step: i + 1,
                total: 5,
                timestep: expected_timesteps[i],
            }
        );
    }
    assert_eq!(events[5], Progress::Decoding);
    assert_eq!(events[5].as_pair(), (-1, -1));
}

#[test]
fn test_generation_is_deterministic() {
    let run = || {
        let pipeline = pipeline(StubSessions::default());
        pipeline
            .text_to_image(
                "a photo of a cat",
                "",
                &config(4),
                |_| {},
                &CancellationToken::new(),
            )
            .unwrap()
            .completed()
            .unwrap()
    };

    let first = run();
    let second = run();
    assert_eq!(first.dimensions(), (64, 64));
    assert_eq!(first.as_raw(), second.as_raw());
}

#[test]
fn test_guidance_changes_result() {
    let pipeline = pipeline(StubSessions::default());
    let run = |scale: f32| {
        let config = SampleConfig {
            guidance_scale: scale,
            ..config(3)
        };
        pipeline
            .text_to_image("a photo of a cat", "", &config, |_| {}, &CancellationToken::new())
            .unwrap()
            .completed()
            .unwrap()
    };
    assert_ne!(run(1.0).as_raw(), run(7.5).as_raw());
}

#[test]
fn test_sessions_released() {
    let sessions = StubSessions::default();
    let counters = sessions.counters.clone();
    let pipeline = pipeline(sessions);

    pipeline
        .text_to_image("a cat", "", &config(3), |_| {}, &CancellationToken::new())
        .unwrap();

    assert_eq!(counters.opened.load(Ordering::SeqCst), 3);
    assert_eq!(counters.dropped.load(Ordering::SeqCst), 3);
    assert_eq!(counters.denoiser_calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_missing_denoiser_fails_before_inference() {
    let sessions = StubSessions {
        missing: Some(ModelKind::Denoiser),
        ..Default::default()
    };
    let counters = sessions.counters.clone();
    let pipeline = pipeline(sessions);

    let mut events = Vec::new();
    let result = pipeline.text_to_image(
        "a cat",
        "",
        &config(3),
        |p| events.push(p),
        &CancellationToken::new(),
    );

    assert!(matches!(
        result,
        Err(PipelineError::Backend(BackendError::NotFound {
            model: ModelKind::Denoiser,
            ..
        }))
    ));
    assert!(events.is_empty());
    assert_eq!(counters.denoiser_calls.load(Ordering::SeqCst), 0);
    // The text encoder session was opened and released
    assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    assert_eq!(counters.dropped.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cancellation_between_steps() {
    let sessions = StubSessions::default();
    let counters = sessions.counters.clone();
    let pipeline = pipeline(sessions);
    let cancel = CancellationToken::new();

    let result = pipeline
        .text_to_image(
            "a cat",
            "",
            &config(5),
            |p| {
                if let Progress::Step { step: 2, .. } = p {
                    cancel.cancel();
                }
            },
            &cancel,
        )
        .unwrap();

    assert!(result.is_cancelled());
    // Step 2 was already running when the flag was set
    assert_eq!(counters.denoiser_calls.load(Ordering::SeqCst), 2);
    // Decoder never opened; encoder and denoiser released
    assert_eq!(counters.opened.load(Ordering::SeqCst), 2);
    assert_eq!(counters.dropped.load(Ordering::SeqCst), 2);
}

#[test]
fn test_bad_denoiser_output_shape() {
    let sessions = StubSessions {
        drop_batch: true,
        ..Default::default()
    };
    let counters = sessions.counters.clone();
    let pipeline = pipeline(sessions);

    let result = pipeline.text_to_image("a cat", "", &config(3), |_| {}, &CancellationToken::new());
    assert!(matches!(
        result,
        Err(PipelineError::Shape {
            name: "noise prediction",
            ..
        })
    ));
    assert_eq!(counters.denoiser_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        counters.opened.load(Ordering::SeqCst),
        counters.dropped.load(Ordering::SeqCst)
    );
}

#[test]
fn test_wrong_latent_shape_rejected() {
    let sessions = StubSessions::default();
    let counters = sessions.counters.clone();
    let pipeline = pipeline(sessions);
    let device = Default::default();

    let embeddings = Tensor::<TestBackend, 3>::zeros([2, 77, HIDDEN_DIM], &device);
    let latent = Tensor::<TestBackend, 4>::zeros([1, 4, 32, 32], &device);
    let result = pipeline.sample_latent(
        embeddings,
        latent,
        &config(3),
        |_| {},
        &CancellationToken::new(),
    );

    assert!(matches!(
        result,
        Err(PipelineError::Shape { name: "latent", .. })
    ));
    assert_eq!(counters.opened.load(Ordering::SeqCst), 0);
}

#[test]
fn test_sample_latent_keeps_shape() {
    let pipeline = pipeline(StubSessions::default());
    let device = Default::default();
    let config = config(2);

    let embeddings = pipeline.encode_prompt("a cat", "", &config).unwrap();
    let latent = config.latent.create::<TestBackend>(&device).unwrap();
    let result = pipeline
        .sample_latent(embeddings, latent, &config, |_| {}, &CancellationToken::new())
        .unwrap();

    match result {
        Generation::Completed(latent) => assert_eq!(latent.dims(), LATENT_SHAPE),
        Generation::Cancelled => panic!("not cancelled"),
    }
}
