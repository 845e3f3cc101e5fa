//! wgpu compute backend.
//!
//! One shader invocation per (frame, grid point); the invocation accumulates
//! the normal equations over its fit window and solves them in-register with
//! Gaussian elimination. The solver arrays are fixed at eight columns, so the
//! backend accepts at most eight fit columns (signal bases plus background);
//! wider requests must run on the CPU backend.
//!
//! Singular windows produce zero coefficients on this path rather than an
//! error; the shader has no error channel.

use wgpu::util::DeviceExt;

use crate::{Background, CancelToken, FitRequest, KernelError, SpotFitKernel};

const SHADER: &str = include_str!("spotfit.wgsl");
const WORKGROUP: u32 = 8;
const MAX_COLUMNS: usize = 8;
const MAX_DISPATCH: u32 = 65_535;

#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
struct FitParams {
    rows: u32,
    cols: u32,
    grid_rows: u32,
    grid_cols: u32,
    n_frames: u32,
    n_signal: u32,
    bg_mode: u32,
    half: u32,
    row_offset: f32,
    col_offset: f32,
    row_period: f32,
    col_period: f32,
    bg_sigma: f32,
    _pad: [f32; 3],
    sigmas: [[f32; 4]; 2],
}

/// Spot-fit backend running on the first available wgpu adapter.
pub struct GpuKernel {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl GpuKernel {
    /// Acquire an adapter and device. Fails with [`KernelError::Backend`]
    /// when no compatible GPU is present.
    pub fn new() -> Result<Self, KernelError> {
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, KernelError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .ok_or_else(|| KernelError::Backend("no compatible GPU adapter found".into()))?;
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("spotfit_device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::downlevel_defaults(),
                ..Default::default()
            })
            .await
            .map_err(|e| KernelError::Backend(format!("failed to request wgpu device: {e}")))?;
        Ok(Self { device, queue })
    }

    fn params(&self, request: &FitRequest<'_>) -> Result<FitParams, KernelError> {
        let n_signal = request.signal_sigmas.len();
        let has_background = !matches!(request.background, Background::None);
        if n_signal + has_background as usize > MAX_COLUMNS {
            return Err(KernelError::Backend(format!(
                "GPU backend supports at most {MAX_COLUMNS} fit columns, request has {}",
                n_signal + has_background as usize
            )));
        }
        if request.n_frames as u32 > MAX_DISPATCH {
            return Err(KernelError::Backend(format!(
                "GPU backend dispatch limit is {MAX_DISPATCH} frames, request has {}",
                request.n_frames
            )));
        }

        let (bg_mode, bg_sigma) = match request.background {
            Background::None => (0u32, 0.0f32),
            Background::Constant => (1, 0.0),
            Background::Gaussian(s) => (2, s as f32),
        };
        let mut sigmas = [[0.0f32; 4]; 2];
        for (k, &s) in request.signal_sigmas.iter().enumerate() {
            sigmas[k / 4][k % 4] = s as f32;
        }
        Ok(FitParams {
            rows: request.rows as u32,
            cols: request.cols as u32,
            grid_rows: request.grid_rows as u32,
            grid_cols: request.grid_cols as u32,
            n_frames: request.n_frames as u32,
            n_signal: n_signal as u32,
            bg_mode,
            half: request.window_half() as u32,
            row_offset: request.row_offset as f32,
            col_offset: request.col_offset as f32,
            row_period: request.row_period as f32,
            col_period: request.col_period as f32,
            bg_sigma,
            _pad: [0.0; 3],
            sigmas,
        })
    }
}

impl SpotFitKernel for GpuKernel {
    fn fit(&self, request: &FitRequest<'_>, cancel: &CancelToken) -> Result<Vec<f32>, KernelError> {
        request.validate()?;
        let params = self.params(request)?;
        if cancel.is_cancelled() {
            return Err(KernelError::Cancelled);
        }
        tracing::debug!(
            frames = params.n_frames,
            grid_points = params.grid_rows * params.grid_cols,
            "dispatching GPU spot fit"
        );

        let frame_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("SpotFitFrames"),
                contents: bytemuck::cast_slice(request.frames),
                usage: wgpu::BufferUsages::STORAGE,
            });

        let output_size = (request.output_len() * std::mem::size_of::<f32>()) as wgpu::BufferAddress;
        let output_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SpotFitOutput"),
            size: output_size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("SpotFitStaging"),
            size: output_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let params_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("SpotFitParams"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("SpotFitBindGroupLayout"),
                    entries: &[
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::COMPUTE,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Storage { read_only: true },
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 1,
                            visibility: wgpu::ShaderStages::COMPUTE,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Storage { read_only: false },
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 2,
                            visibility: wgpu::ShaderStages::COMPUTE,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                    ],
                });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("SpotFitBindGroup"),
            layout: &bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: frame_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: output_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buffer.as_entire_binding(),
                },
            ],
        });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("SpotFitPipelineLayout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });

        let shader = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("SpotFitShader"),
                source: wgpu::ShaderSource::Wgsl(SHADER.into()),
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("SpotFitPipeline"),
                layout: Some(&pipeline_layout),
                module: &shader,
                entry_point: Some("spot_fit"),
                compilation_options: Default::default(),
                cache: None,
            });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("SpotFitEncoder"),
            });

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor::default());
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let x = (params.grid_cols + WORKGROUP - 1) / WORKGROUP;
            let y = (params.grid_rows + WORKGROUP - 1) / WORKGROUP;
            pass.dispatch_workgroups(x.max(1), y.max(1), params.n_frames.max(1));
        }

        encoder.copy_buffer_to_buffer(&output_buffer, 0, &staging_buffer, 0, output_size);
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        buffer_slice.map_async(wgpu::MapMode::Read, |_| {});
        let _ = self.device.poll(wgpu::MaintainBase::Wait);

        if cancel.is_cancelled() {
            return Err(KernelError::Cancelled);
        }

        let data = buffer_slice.get_mapped_range();
        let out: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging_buffer.unmap();

        Ok(out)
    }
}
