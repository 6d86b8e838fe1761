//! Device runtime state
//!
//! Built once from a validated [`DeviceConfig`] and treated as immutable
//! afterwards, except for the color buffers and frame-reassembly state
//! which mutate under a single lock for the runtime's whole lifetime.

use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

use crate::config::{ConfigError, DeviceConfig, OutputSpec, OutputType};

/// Display height a linear strip's single logical row is replicated to
pub const LINEAR_DISPLAY_HEIGHT: usize = 4;
/// Vertical gap between stacked outputs on the composite canvas
pub const OUTPUT_GAP: usize = 2;

const BYTES_PER_LED: usize = 3;

/// One per-LED color update addressed by global LED index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelUpdate {
    pub index: u16,
    pub rgb: [u8; 3],
}

/// Derived per-output state: address space slice and virtual display shape
#[derive(Debug, Clone)]
pub struct OutputRuntime {
    pub id: String,
    pub name: String,
    pub output_type: OutputType,
    pub leds_count: u32,
    /// First global LED index of this output
    pub offset: usize,
    pub virtual_width: usize,
    pub virtual_height: usize,
    /// Global LED index per virtual cell; `None` marks an unmapped cell.
    /// For Linear outputs this covers the single logical row only.
    pub virtual_to_global: Vec<Option<usize>>,
    /// Canvas placement, top-to-bottom stacking in config order
    pub top: usize,
    /// Canvas placement, horizontally centered
    pub left: usize,
}

/// Owned snapshot of one output's render surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub width: usize,
    pub height: usize,
    /// RGB bytes, `width * height * 3`
    pub pixels: Vec<u8>,
}

/// Everything the buffer lock guards: color slots, reassembly state,
/// dirty flag, and the per-output render buffers.
struct FrameState {
    front: Vec<u8>,
    back: Vec<u8>,
    dirty: bool,
    current_frame_id: Option<u8>,
    received_fragments: HashSet<u8>,
    total_fragments: usize,
    render: Vec<Vec<u8>>,
}

impl FrameState {
    /// Swap the buffer slots and close the current frame cycle.
    fn complete_frame(&mut self) {
        std::mem::swap(&mut self.front, &mut self.back);
        self.dirty = true;
        self.received_fragments.clear();
    }
}

/// The simulated device: global LED address space plus mutable color state
pub struct DeviceRuntime {
    name: String,
    description: String,
    serial: String,
    udp_port: u16,
    pixel_size: u16,
    outputs: Vec<OutputRuntime>,
    total_leds: usize,
    canvas_width: usize,
    canvas_height: usize,
    state: Mutex<FrameState>,
}

impl DeviceRuntime {
    /// Build the runtime from a validated config.
    ///
    /// Fails only on an empty output list, which the validator already
    /// rejects; the check here is a defensive assertion.
    pub fn new(config: &DeviceConfig) -> Result<Self, ConfigError> {
        if config.outputs.is_empty() {
            return Err(ConfigError::NoOutputs);
        }

        let mut outputs = Vec::with_capacity(config.outputs.len());
        let mut offset = 0usize;
        let mut top = 0usize;
        let mut max_width = 1usize;

        for spec in &config.outputs {
            let output = build_output(spec, offset, top);
            offset += spec.leds_count as usize;
            top += output.virtual_height + OUTPUT_GAP;
            max_width = max_width.max(output.virtual_width);
            outputs.push(output);
        }

        let canvas_width = max_width;
        let canvas_height = (top - OUTPUT_GAP).max(1);
        for output in &mut outputs {
            output.left = canvas_width.saturating_sub(output.virtual_width) / 2;
        }

        let total_leds = offset;
        let buffer_size = total_leds * BYTES_PER_LED;
        let render = outputs
            .iter()
            .map(|o| vec![0u8; o.virtual_width * o.virtual_height * BYTES_PER_LED])
            .collect();

        // 16 uppercase hex chars, fresh for every process start.
        let serial = Uuid::new_v4().simple().to_string()[..16].to_ascii_uppercase();

        Ok(Self {
            name: config.device_name.clone(),
            description: "Virtual LED test device".to_string(),
            serial,
            udp_port: config.udp_port,
            pixel_size: config.pixel_size,
            outputs,
            total_leds,
            canvas_width,
            canvas_height,
            state: Mutex::new(FrameState {
                front: vec![0u8; buffer_size],
                back: vec![0u8; buffer_size],
                dirty: true,
                current_frame_id: None,
                received_fragments: HashSet::new(),
                total_fragments: 0,
                render,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn pixel_size(&self) -> u16 {
        self.pixel_size
    }

    pub fn outputs(&self) -> &[OutputRuntime] {
        &self.outputs
    }

    pub fn total_leds(&self) -> usize {
        self.total_leds
    }

    pub fn canvas_size(&self) -> (usize, usize) {
        (self.canvas_width, self.canvas_height)
    }

    /// Dimensions reported to clients: the first Matrix output, else the
    /// first Linear output as a one-row strip, else 1x1.
    pub fn primary_dimensions(&self) -> (u16, u16) {
        for output in &self.outputs {
            if output.output_type == OutputType::Matrix {
                return (
                    output.virtual_width.min(u16::MAX as usize) as u16,
                    output.virtual_height.min(u16::MAX as usize) as u16,
                );
            }
        }
        for output in &self.outputs {
            if output.output_type == OutputType::Linear {
                return (output.virtual_width.min(u16::MAX as usize) as u16, 1);
            }
        }
        (1, 1)
    }

    /// Apply one fragment of a frame to the back buffer and drive the
    /// reassembly state machine.
    ///
    /// A fragment for a different frame id than the current one resets the
    /// cycle and adopts the fragment's declared fragment count. Once the
    /// distinct received-index count reaches that total, the buffers swap
    /// and the frame closes.
    pub fn apply_fragment(
        &self,
        frame_id: u8,
        total_fragments: u8,
        fragment_index: u8,
        updates: &[PixelUpdate],
    ) {
        let mut state = self.state.lock().expect("buffer lock poisoned");

        if state.current_frame_id != Some(frame_id) {
            state.current_frame_id = Some(frame_id);
            state.received_fragments.clear();
            state.total_fragments = total_fragments as usize;
        }

        let buffer_size = state.back.len();
        for update in updates {
            let at = update.index as usize * BYTES_PER_LED;
            // Out-of-range indices are a tolerated client error, not a fault.
            if at + BYTES_PER_LED <= buffer_size {
                state.back[at..at + BYTES_PER_LED].copy_from_slice(&update.rgb);
            }
        }

        state.received_fragments.insert(fragment_index);

        if state.received_fragments.len() >= state.total_fragments {
            state.complete_frame();
        }
    }

    /// Explicit frame-end signal: force-complete the current frame if the
    /// id matches, regardless of how many fragments arrived. A stale or
    /// unknown id is ignored.
    pub fn apply_frame_end(&self, frame_id: u8) {
        let mut state = self.state.lock().expect("buffer lock poisoned");
        if state.current_frame_id == Some(frame_id) {
            state.complete_frame();
        }
    }

    pub fn mark_dirty(&self) {
        self.state.lock().expect("buffer lock poisoned").dirty = true;
    }

    /// Atomically read and clear the dirty flag.
    pub fn consume_dirty(&self) -> bool {
        let mut state = self.state.lock().expect("buffer lock poisoned");
        std::mem::take(&mut state.dirty)
    }

    /// Copy the front buffer into every output's render buffer through its
    /// virtual-to-global table. Unmapped cells become black; linear strips
    /// replicate their single logical row across the display height.
    pub fn fill_output_buffers(&self) {
        let mut state = self.state.lock().expect("buffer lock poisoned");
        let FrameState { front, render, .. } = &mut *state;

        for (output, buffer) in self.outputs.iter().zip(render.iter_mut()) {
            if output.output_type == OutputType::Linear {
                let width = output.virtual_width;
                for (x, global) in output.virtual_to_global.iter().enumerate() {
                    let rgb = match global {
                        Some(idx) => {
                            let src = idx * BYTES_PER_LED;
                            [front[src], front[src + 1], front[src + 2]]
                        }
                        None => [0, 0, 0],
                    };
                    for y in 0..output.virtual_height {
                        let dst = (y * width + x) * BYTES_PER_LED;
                        buffer[dst..dst + BYTES_PER_LED].copy_from_slice(&rgb);
                    }
                }
                continue;
            }

            for (cell, global) in output.virtual_to_global.iter().enumerate() {
                let dst = cell * BYTES_PER_LED;
                match global {
                    Some(idx) => {
                        let src = idx * BYTES_PER_LED;
                        buffer[dst..dst + BYTES_PER_LED]
                            .copy_from_slice(&front[src..src + BYTES_PER_LED]);
                    }
                    None => {
                        buffer[dst..dst + BYTES_PER_LED].fill(0);
                    }
                }
            }
        }
    }

    /// Owned copies of every output's render surface, in config order
    pub fn output_frames(&self) -> Vec<OutputFrame> {
        let state = self.state.lock().expect("buffer lock poisoned");
        self.outputs
            .iter()
            .zip(state.render.iter())
            .map(|(output, buffer)| OutputFrame {
                width: output.virtual_width,
                height: output.virtual_height,
                pixels: buffer.clone(),
            })
            .collect()
    }
}

fn build_output(spec: &OutputSpec, offset: usize, top: usize) -> OutputRuntime {
    let (virtual_width, virtual_height, virtual_to_global) = match spec.output_type {
        OutputType::Matrix => {
            // Validation guarantees the matrix block exists for this type.
            let matrix = spec.matrix.as_ref().expect("matrix output without map");
            let table = matrix
                .map
                .iter()
                .map(|cell| cell.map(|idx| offset + idx as usize))
                .collect();
            (matrix.width as usize, matrix.height as usize, table)
        }
        OutputType::Linear => {
            let width = spec.leds_count as usize;
            let table = (0..width).map(|x| Some(offset + x)).collect();
            (width, LINEAR_DISPLAY_HEIGHT, table)
        }
        OutputType::Single => (1, 1, vec![Some(offset)]),
    };

    OutputRuntime {
        id: spec.id.clone(),
        name: spec.name.clone(),
        output_type: spec.output_type,
        leds_count: spec.leds_count,
        offset,
        virtual_width,
        virtual_height,
        virtual_to_global,
        top,
        left: 0,
    }
}
