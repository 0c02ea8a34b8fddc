mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{chain, serial, target, Event, Recorder, RecordingBackend, RecordingEffect};
use kraft::{
    sampled, CancellationToken, DeferredSender, DrawPass, Effect, EffectHandle, ErrorMode,
    FloatInputExt, FrameStatus, KraftError, ManualClock, MutableInput, Phase, SampledInput,
    Sampling, SerialChain, Size, TimeInput, Uniform, UniformLocation, UniformProgram, UniformSink,
    UniformValue,
};

type Chain = SerialChain<RecordingBackend>;

fn markers(recorder: &Recorder) -> Vec<String> {
    recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            Event::Marker(note) => Some(note),
            _ => None,
        })
        .collect()
}

fn approx(actual: f32, expected: f32) {
    assert!(
        (actual - expected).abs() < 1e-4,
        "expected {expected}, got {actual}"
    );
}

#[test]
fn tasks_from_other_threads_run_in_order_before_drawing() {
    let (pipeline, recorder) = serial(ErrorMode::Propagate);
    chain(&pipeline, &recorder, &["a"]);
    pipeline.set_target_buffer(target(&recorder, Size::new(4, 4)));

    let sender = pipeline.deferred_sender();
    let worker_recorder = recorder.clone();
    thread::spawn(move || {
        for index in 0..3 {
            let recorder = worker_recorder.clone();
            sender.submit(move |_gpu: &mut RecordingBackend, _chain: &mut Chain| {
                recorder.mark(format!("task {index}"));
                Ok(())
            });
        }
    })
    .join()
    .unwrap();
    assert_eq!(pipeline.deferred_sender().pending(), 4);

    pipeline.run().unwrap();

    let events = recorder.events();
    let first_draw = events
        .iter()
        .position(|event| matches!(event, Event::Draw { .. }))
        .unwrap();
    let last_marker = events
        .iter()
        .rposition(|event| matches!(event, Event::Marker(_)))
        .unwrap();
    assert!(last_marker < first_draw);
    assert_eq!(markers(&recorder), vec!["task 0", "task 1", "task 2"]);
    assert_eq!(pipeline.deferred_sender().pending(), 0);
    assert_eq!(pipeline.phase(), Phase::Idle);
}

/// Queues a task every time it draws, i.e. while the frame is executing.
struct Requeueing {
    sender: DeferredSender<RecordingBackend, Chain>,
    recorder: Recorder,
    draws: u32,
}

impl Effect<RecordingBackend> for Requeueing {
    fn name(&self) -> &str {
        "requeueing"
    }

    fn draw(
        &mut self,
        _gpu: &mut RecordingBackend,
        _pass: DrawPass<'_, RecordingBackend>,
    ) -> Result<(), KraftError> {
        self.draws += 1;
        let recorder = self.recorder.clone();
        let frame = self.draws;
        self.recorder.mark(format!("draw {frame}"));
        self.sender
            .submit(move |_gpu: &mut RecordingBackend, _chain: &mut Chain| {
                recorder.mark(format!("queued during frame {frame}"));
                Ok(())
            });
        Ok(())
    }

    fn delete(&mut self, _gpu: &mut RecordingBackend, _recursively: bool) {}
}

#[test]
fn tasks_queued_while_executing_wait_for_next_frame() {
    let (pipeline, recorder) = serial(ErrorMode::Propagate);
    pipeline.add_effect(Requeueing {
        sender: pipeline.deferred_sender(),
        recorder: recorder.clone(),
        draws: 0,
    });
    pipeline.set_target_buffer(target(&recorder, Size::new(4, 4)));

    pipeline.run().unwrap();
    assert_eq!(markers(&recorder), vec!["draw 1"]);
    assert_eq!(pipeline.deferred_sender().pending(), 1);

    pipeline.run().unwrap();
    assert_eq!(
        markers(&recorder),
        vec!["draw 1", "queued during frame 1", "draw 2"]
    );
}

#[test]
fn failed_task_keeps_the_rest_for_next_frame() {
    let (pipeline, recorder) = serial(ErrorMode::Swallow);
    chain(&pipeline, &recorder, &["a"]);
    pipeline.set_target_buffer(target(&recorder, Size::new(4, 4)));
    for (name, fails) in [("first", false), ("second", true), ("third", false)] {
        let recorder = recorder.clone();
        pipeline.submit(move |_gpu: &mut RecordingBackend, _chain: &mut Chain| {
            recorder.mark(name);
            if fails {
                Err(KraftError::backend("upload failed"))
            } else {
                Ok(())
            }
        });
    }

    assert_eq!(pipeline.run(), Ok(FrameStatus::Failed));
    assert!(recorder.draws().is_empty());
    assert_eq!(pipeline.deferred_sender().pending(), 1);

    assert_eq!(pipeline.run(), Ok(FrameStatus::Completed));
    assert_eq!(markers(&recorder), vec!["first", "second", "third"]);
    assert_eq!(recorder.draws().len(), 1);
}

/// Cancels `token` from inside its own draw.
struct Cancelling {
    token: CancellationToken,
    recorder: Recorder,
}

impl Effect<RecordingBackend> for Cancelling {
    fn name(&self) -> &str {
        "cancelling"
    }

    fn draw(
        &mut self,
        _gpu: &mut RecordingBackend,
        _pass: DrawPass<'_, RecordingBackend>,
    ) -> Result<(), KraftError> {
        self.recorder.mark("cancelling");
        self.token.cancel();
        Ok(())
    }

    fn delete(&mut self, _gpu: &mut RecordingBackend, _recursively: bool) {}
}

#[test]
fn cancellation_stops_between_stages() {
    let (pipeline, recorder) = serial(ErrorMode::Propagate);
    let token = CancellationToken::new();
    pipeline.add_effect(RecordingEffect::new(&recorder, "first"));
    pipeline.add_effect(Cancelling {
        token: token.clone(),
        recorder: recorder.clone(),
    });
    pipeline.add_effect(RecordingEffect::new(&recorder, "last"));
    pipeline.set_target_buffer(target(&recorder, Size::new(4, 4)));

    assert_eq!(pipeline.run_with(&token), Ok(FrameStatus::Cancelled));
    assert_eq!(recorder.destinations(), vec!["scratch-b1".to_string()]);
    assert_eq!(markers(&recorder), vec!["cancelling"]);
    assert_eq!(pipeline.phase(), Phase::Idle);

    recorder.clear();
    assert_eq!(pipeline.run_with(&token), Ok(FrameStatus::Cancelled));
    assert!(recorder.events().is_empty());

    assert_eq!(pipeline.run(), Ok(FrameStatus::Completed));
    assert_eq!(recorder.destinations().last(), Some(&"target".to_string()));
}

#[test]
fn cancelled_pipeline_token_skips_sampling() {
    let (pipeline, recorder) = serial(ErrorMode::Propagate);
    chain(&pipeline, &recorder, &["a"]);
    pipeline.set_target_buffer(target(&recorder, Size::new(4, 4)));
    let pulls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&pulls);
    let input = sampled(move || counter.fetch_add(1, Ordering::SeqCst));
    pipeline.connect_input(input, Sampling::Internal, |_chain: &mut Chain, _value: u32| Ok(()));

    pipeline.cancel_token().cancel();

    assert_eq!(pipeline.run(), Ok(FrameStatus::Cancelled));
    assert_eq!(pulls.load(Ordering::SeqCst), 1);
    assert!(recorder.draws().is_empty());
}

#[test]
fn internal_inputs_are_sampled_once_per_frame() {
    let (pipeline, recorder) = serial(ErrorMode::Propagate);
    let effect = pipeline.add_effect(RecordingEffect::new(&recorder, "a"));
    pipeline.set_target_buffer(target(&recorder, Size::new(4, 4)));

    let pulls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&pulls);
    let input = sampled(move || counter.fetch_add(1, Ordering::SeqCst) as f32);
    // Constructing the cache pulls once.
    assert_eq!(pulls.load(Ordering::SeqCst), 1);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    pipeline.connect_input(
        Arc::clone(&input),
        Sampling::Internal,
        move |_chain: &mut Chain, value: f32| {
            log.lock().unwrap().push(value);
            Ok(())
        },
    );
    pipeline.connect_effect_input(
        effect,
        Arc::clone(&input),
        Sampling::Internal,
        |effect: &mut RecordingEffect, value: f32| {
            effect.level = value;
            Ok(())
        },
    );

    for _ in 0..3 {
        pipeline.run().unwrap();
    }

    assert_eq!(pulls.load(Ordering::SeqCst), 4);
    assert_eq!(*seen.lock().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(pipeline.with_effect(effect, |effect| effect.level), Some(3.0));
}

#[test]
fn external_inputs_are_left_to_the_host() {
    let (pipeline, recorder) = serial(ErrorMode::Propagate);
    let effect = pipeline.add_effect(RecordingEffect::new(&recorder, "a"));
    pipeline.set_target_buffer(target(&recorder, Size::new(4, 4)));

    let pulls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&pulls);
    let input = sampled(move || counter.fetch_add(1, Ordering::SeqCst) as f32 * 10.0);
    pipeline.connect_effect_input(
        effect,
        Arc::clone(&input),
        Sampling::External,
        |effect: &mut RecordingEffect, value: f32| {
            effect.level = value;
            Ok(())
        },
    );

    pipeline.run().unwrap();
    pipeline.run().unwrap();
    assert_eq!(pulls.load(Ordering::SeqCst), 1);
    assert_eq!(pipeline.with_effect(effect, |effect| effect.level), Some(0.0));

    input.sample();
    pipeline.run().unwrap();
    assert_eq!(pipeline.with_effect(effect, |effect| effect.level), Some(10.0));
}

#[test]
fn removing_an_effect_drops_its_bindings() {
    let (pipeline, recorder) = serial(ErrorMode::Propagate);
    let effect = pipeline.add_effect(RecordingEffect::new(&recorder, "a"));
    pipeline.set_target_buffer(target(&recorder, Size::new(4, 4)));

    let pulls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&pulls);
    let input = sampled(move || counter.fetch_add(1, Ordering::SeqCst));
    pipeline.connect_effect_input(
        effect,
        input,
        Sampling::Internal,
        |_effect: &mut RecordingEffect, _value: u32| Ok(()),
    );
    pipeline.run().unwrap();
    assert_eq!(pulls.load(Ordering::SeqCst), 2);

    pipeline.remove_effect(effect);
    pipeline.run().unwrap();
    assert_eq!(pulls.load(Ordering::SeqCst), 2);
}

#[test]
fn time_input_drives_effect_state() {
    let (pipeline, recorder) = serial(ErrorMode::Propagate);
    let clock = Arc::new(ManualClock::new());
    let time = Arc::new(TimeInput::new(clock.clone()));
    let seconds = pipeline.add_effect(RecordingEffect::new(&recorder, "seconds"));
    let bounced = pipeline.add_effect(RecordingEffect::new(&recorder, "bounced"));
    pipeline.set_target_buffer(target(&recorder, Size::new(4, 4)));

    pipeline.connect_effect_input(
        seconds,
        Arc::clone(&time),
        Sampling::Internal,
        |effect: &mut RecordingEffect, value: f32| {
            effect.level = value;
            Ok(())
        },
    );
    pipeline.connect_effect_input(
        bounced,
        time.bounce_between(0.0, 1.0),
        Sampling::Internal,
        |effect: &mut RecordingEffect, value: f32| {
            effect.level = value;
            Ok(())
        },
    );
    let level = |handle: EffectHandle<RecordingEffect>| {
        pipeline.with_effect(handle, |effect| effect.level)
    };

    clock.set_millis(2_000);
    pipeline.run().unwrap();
    approx(level(seconds).unwrap(), 0.0);

    time.start();
    clock.advance(Duration::from_millis(1_500));
    pipeline.run().unwrap();
    approx(level(seconds).unwrap(), 1.5);
    approx(level(bounced).unwrap(), 0.5);

    time.pause();
    clock.advance(Duration::from_secs(5));
    pipeline.run().unwrap();
    approx(level(seconds).unwrap(), 1.5);

    time.start();
    clock.advance(Duration::from_millis(250));
    pipeline.run().unwrap();
    approx(level(seconds).unwrap(), 1.75);
    approx(level(bounced).unwrap(), 0.25);
}

#[derive(Clone, Default)]
struct Uploads(Arc<Mutex<Vec<(u32, UniformValue)>>>);

impl Uploads {
    fn count(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

struct SpySink {
    uploads: Uploads,
}

impl UniformSink for SpySink {
    fn label(&self) -> &str {
        "spy"
    }

    fn resolve(&mut self, name: &str) -> Option<UniformLocation> {
        (name == "level").then_some(UniformLocation(3))
    }

    fn upload(&mut self, location: UniformLocation, value: &UniformValue) -> Result<(), KraftError> {
        self.uploads.0.lock().unwrap().push((location.0, value.clone()));
        Ok(())
    }
}

/// Uploads its uniforms right before drawing, as a shader program would.
struct UniformEffect {
    program: UniformProgram<SpySink>,
    level: Uniform<f32>,
    missing: Uniform<f32>,
}

impl Effect<RecordingBackend> for UniformEffect {
    fn name(&self) -> &str {
        "uniforms"
    }

    fn draw(
        &mut self,
        _gpu: &mut RecordingBackend,
        _pass: DrawPass<'_, RecordingBackend>,
    ) -> Result<(), KraftError> {
        self.program.flush().map(|_| ())
    }

    fn delete(&mut self, _gpu: &mut RecordingBackend, _recursively: bool) {}
}

#[test]
fn unchanged_uniforms_upload_once() {
    let (pipeline, recorder) = serial(ErrorMode::Propagate);
    let uploads = Uploads::default();
    let effect = pipeline.add_effect(UniformEffect {
        program: UniformProgram::new(SpySink {
            uploads: uploads.clone(),
        }),
        level: Uniform::required("level"),
        missing: Uniform::required("missing"),
    });
    pipeline.set_target_buffer(target(&recorder, Size::new(4, 4)));
    let value = Arc::new(MutableInput::new(0.5_f32));
    pipeline.connect_effect_input(
        effect,
        Arc::clone(&value),
        Sampling::Internal,
        |effect: &mut UniformEffect, level: f32| {
            let UniformEffect { program, level: slot, .. } = effect;
            program.set(slot, level).map(|_| ())
        },
    );

    for _ in 0..3 {
        pipeline.run().unwrap();
    }
    assert_eq!(uploads.count(), 1);

    value.set(0.75);
    pipeline.run().unwrap();
    pipeline.run().unwrap();
    assert_eq!(uploads.count(), 2);
    assert_eq!(
        uploads.0.lock().unwrap().last(),
        Some(&(3, UniformValue::Float(0.75)))
    );
}

#[test]
fn unresolved_required_uniform_aborts_even_when_swallowing() {
    let (pipeline, recorder) = serial(ErrorMode::Swallow);
    let effect = pipeline.add_effect(UniformEffect {
        program: UniformProgram::new(SpySink {
            uploads: Uploads::default(),
        }),
        level: Uniform::required("level"),
        missing: Uniform::required("missing"),
    });
    pipeline.set_target_buffer(target(&recorder, Size::new(4, 4)));
    pipeline
        .with_effect(effect, |effect| {
            let UniformEffect { program, missing, .. } = effect;
            program.set(missing, 1.0)
        })
        .unwrap()
        .unwrap();

    assert_eq!(
        pipeline.run(),
        Err(KraftError::UnresolvedUniform {
            program: "spy".to_string(),
            name: "missing".to_string(),
        })
    );
}
