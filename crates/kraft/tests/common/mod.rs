#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use kraft::{
    DrawPass, Effect, ErrorMode, GlBuffer, GpuBackend, GpuContext, KraftError, SerialPipeline,
    Size, TwoInputEffect,
};
use kraftconfig::{ContextSettings, PipelineSettings};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Allocated { label: String, size: Size, texture: u32 },
    Resized { label: String, size: Size },
    Deleted { label: String },
    Draw { effect: String, inputs: Vec<u32>, destination: String },
    Copy { source: u32, destination: String },
    EffectDeleted { effect: String },
    Marker(String),
}

/// Shared log of everything the backend, its buffers and the test effects did.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    next_texture: Arc<AtomicU32>,
}

impl Recorder {
    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn mark(&self, note: impl Into<String>) {
        self.push(Event::Marker(note.into()));
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    fn next_texture(&self) -> u32 {
        self.next_texture.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn allocations(&self) -> Vec<(String, Size)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Allocated { label, size, .. } => Some((label, size)),
                _ => None,
            })
            .collect()
    }

    pub fn deletions(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Deleted { label } => Some(label),
                _ => None,
            })
            .collect()
    }

    /// `(effect, input labels, destination)` per draw, inputs resolved to
    /// the label of the buffer that allocated them.
    pub fn draws(&self) -> Vec<(String, Vec<String>, String)> {
        let events = self.events();
        events
            .iter()
            .filter_map(|event| match event {
                Event::Draw {
                    effect,
                    inputs,
                    destination,
                } => Some((
                    effect.clone(),
                    inputs.iter().map(|id| label_of(&events, *id)).collect(),
                    destination.clone(),
                )),
                _ => None,
            })
            .collect()
    }

    pub fn destinations(&self) -> Vec<String> {
        self.draws()
            .into_iter()
            .map(|(_, _, destination)| destination)
            .collect()
    }
}

fn label_of(events: &[Event], texture: u32) -> String {
    events
        .iter()
        .rev()
        .find_map(|event| match event {
            Event::Allocated {
                label, texture: id, ..
            } if *id == texture => Some(label.clone()),
            _ => None,
        })
        .unwrap_or_else(|| format!("external#{texture}"))
}

/// Backend whose textures are plain ids and whose every call is recorded.
pub struct RecordingBackend {
    recorder: Recorder,
}

impl GpuBackend for RecordingBackend {
    type Texture = u32;

    fn make_current(&mut self) -> Result<(), KraftError> {
        Ok(())
    }

    fn allocate_buffer(
        &mut self,
        label: &str,
        size: Size,
    ) -> Result<Box<dyn GlBuffer<Self>>, KraftError> {
        Ok(Box::new(RecordingBuffer::new(&self.recorder, label, size)))
    }

    fn copy_texture(
        &mut self,
        source: &u32,
        target: &mut dyn GlBuffer<Self>,
    ) -> Result<(), KraftError> {
        self.recorder.push(Event::Copy {
            source: *source,
            destination: target.label().to_string(),
        });
        Ok(())
    }

    fn terminate(&mut self) {}
}

pub struct RecordingBuffer {
    recorder: Recorder,
    label: String,
    size: Size,
    texture: Option<u32>,
}

impl RecordingBuffer {
    pub fn new(recorder: &Recorder, label: &str, size: Size) -> Self {
        let texture = recorder.next_texture();
        recorder.push(Event::Allocated {
            label: label.to_string(),
            size,
            texture,
        });
        Self {
            recorder: recorder.clone(),
            label: label.to_string(),
            size,
            texture: Some(texture),
        }
    }
}

impl GlBuffer<RecordingBackend> for RecordingBuffer {
    fn label(&self) -> &str {
        &self.label
    }

    fn size(&self) -> Size {
        self.size
    }

    fn texture(&self) -> Option<u32> {
        self.texture
    }

    fn before_draw(&mut self, _gpu: &mut RecordingBackend) -> Result<(), KraftError> {
        match self.texture {
            Some(_) => Ok(()),
            None => Err(KraftError::backend(format!("{} drawn after delete", self.label))),
        }
    }

    fn after_draw(&mut self, _gpu: &mut RecordingBackend) -> Result<(), KraftError> {
        Ok(())
    }

    fn resize(&mut self, _gpu: &mut RecordingBackend, size: Size) -> Result<(), KraftError> {
        self.size = size;
        self.recorder.push(Event::Resized {
            label: self.label.clone(),
            size,
        });
        Ok(())
    }

    fn delete(&mut self, _gpu: &mut RecordingBackend) {
        if self.texture.take().is_some() {
            self.recorder.push(Event::Deleted {
                label: self.label.clone(),
            });
        }
    }
}

/// Effect that records its draws. `fail_with` makes every draw fail.
pub struct RecordingEffect {
    name: String,
    recorder: Recorder,
    pub fail_with: Option<KraftError>,
    pub level: f32,
}

impl RecordingEffect {
    pub fn new(recorder: &Recorder, name: &str) -> Self {
        Self {
            name: name.to_string(),
            recorder: recorder.clone(),
            fail_with: None,
            level: 0.0,
        }
    }
}

impl Effect<RecordingBackend> for RecordingEffect {
    fn name(&self) -> &str {
        &self.name
    }

    fn draw(
        &mut self,
        _gpu: &mut RecordingBackend,
        pass: DrawPass<'_, RecordingBackend>,
    ) -> Result<(), KraftError> {
        if let Some(err) = self.fail_with.clone() {
            return Err(err);
        }
        self.recorder.push(Event::Draw {
            effect: self.name.clone(),
            inputs: pass.inputs.to_vec(),
            destination: pass.target.label().to_string(),
        });
        Ok(())
    }

    fn delete(&mut self, _gpu: &mut RecordingBackend, _recursively: bool) {
        self.recorder.push(Event::EffectDeleted {
            effect: self.name.clone(),
        });
    }
}

/// Two-input counterpart of [`RecordingEffect`].
pub struct RecordingBlend {
    recorder: Recorder,
}

impl RecordingBlend {
    pub fn new(recorder: &Recorder) -> Self {
        Self {
            recorder: recorder.clone(),
        }
    }
}

impl TwoInputEffect<RecordingBackend> for RecordingBlend {
    fn name(&self) -> &str {
        "blend"
    }

    fn draw_pair(
        &mut self,
        _gpu: &mut RecordingBackend,
        first: &u32,
        second: &u32,
        target: &mut dyn GlBuffer<RecordingBackend>,
    ) -> Result<(), KraftError> {
        self.recorder.push(Event::Draw {
            effect: "blend".to_string(),
            inputs: vec![*first, *second],
            destination: target.label().to_string(),
        });
        Ok(())
    }

    fn delete(&mut self, _gpu: &mut RecordingBackend, _recursively: bool) {
        self.recorder.push(Event::EffectDeleted {
            effect: "blend".to_string(),
        });
    }
}

pub fn spawn(recorder: &Recorder) -> GpuContext<RecordingBackend> {
    let backend = RecordingBackend {
        recorder: recorder.clone(),
    };
    GpuContext::spawn(backend, &ContextSettings::default()).unwrap()
}

pub fn serial(mode: ErrorMode) -> (SerialPipeline<RecordingBackend>, Recorder) {
    let recorder = Recorder::default();
    let context = spawn(&recorder);
    let pipeline = SerialPipeline::serial(context, &PipelineSettings::labelled("test"), mode);
    (pipeline, recorder)
}

/// Creates a buffer on the caller's thread; only allocation is recorded.
pub fn target(recorder: &Recorder, size: Size) -> Box<dyn GlBuffer<RecordingBackend>> {
    Box::new(RecordingBuffer::new(recorder, "target", size))
}

pub fn chain(pipeline: &SerialPipeline<RecordingBackend>, recorder: &Recorder, names: &[&str]) {
    for name in names {
        pipeline.add_effect(RecordingEffect::new(recorder, name));
    }
}
