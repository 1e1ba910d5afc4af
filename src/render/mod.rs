//! GPU Renderer
//!
//! Uploads captured frames to textures, applies the output transform, and
//! reads pixels back for the RFB layer. Runs on a surfaceless EGL display
//! with a GLES2 context; nothing is ever presented.
//!
//! Two full-size textured framebuffers hold the current and previous frame.
//! After every upload the damage program compares them into a downsampled
//! target of one pixel per 32×32 tile, which is read back to build the
//! frame's [`DamageRegion`].
//!
//! Dma-buf frames are imported as external-image textures from their plane
//! fds; the fds are closed as soon as the EGL image exists. Shared-memory
//! frames are uploaded with `glTexImage2D`, honouring the row stride via the
//! unpack row length.

pub mod damage;
pub mod shaders;

use std::ffi::c_void;
use std::os::fd::AsRawFd;
use std::ptr;

use gl::types::{GLenum, GLint, GLuint};
use khronos_egl as egl;
use thiserror::Error;
use tracing::{debug, info, warn};
use wayland_client::protocol::wl_output::Transform;

use crate::capture::dmabuf::DmabufFrame;
use crate::capture::{
    DRM_FORMAT_ABGR8888, DRM_FORMAT_ARGB8888, DRM_FORMAT_XBGR8888, DRM_FORMAT_XRGB8888,
};
use damage::{DamageRegion, TILE_SIZE};

/// Rendering errors; all are fatal at init, per-frame failures drop the frame
#[derive(Error, Debug)]
pub enum RenderError {
    /// libEGL could not be loaded
    #[error("failed to load libEGL: {0}")]
    LoadLibrary(String),

    /// An EGL call failed
    #[error("EGL: {0}")]
    Egl(String),

    /// No EGL config matched the requested attributes
    #[error("no suitable EGL config found")]
    NoConfig,

    /// A required GL extension function is missing
    #[error("missing GL extension function: {0}")]
    Extension(&'static str),

    /// Shader compilation failed
    #[error("failed to compile shader '{name}': {log}")]
    ShaderCompile {
        /// Shader identifier
        name: &'static str,
        /// Driver info log
        log: String,
    },

    /// Program linking failed
    #[error("failed to link program '{name}': {log}")]
    ProgramLink {
        /// Program identifier
        name: &'static str,
        /// Driver info log
        log: String,
    },

    /// Framebuffer object is incomplete
    #[error("framebuffer incomplete (status {0:#x})")]
    FramebufferIncomplete(u32),

    /// EGL image creation over dma-buf planes failed
    #[error("failed to import dma-buf frame: {0}")]
    ImageImport(String),

    /// A frame with no planes was handed over
    #[error("dma-buf frame carries no planes")]
    EmptyFrame,
}

type EglInstance = egl::DynamicInstance<egl::EGL1_5>;

/// `EGL_PLATFORM_SURFACELESS_MESA`
const EGL_PLATFORM_SURFACELESS_MESA: egl::Enum = 0x31DD;
/// `EGL_LINUX_DMA_BUF_EXT`
const EGL_LINUX_DMA_BUF_EXT: egl::Enum = 0x3270;
/// `EGL_LINUX_DRM_FOURCC_EXT`
const EGL_LINUX_DRM_FOURCC_EXT: usize = 0x3271;

/// Per-plane EGL attribute names: (fd, offset, pitch, modifier lo, modifier hi)
const PLANE_ATTRS: [(usize, usize, usize, usize, usize); 4] = [
    (0x3272, 0x3273, 0x3274, 0x3443, 0x3444),
    (0x3275, 0x3276, 0x3277, 0x3445, 0x3446),
    (0x3278, 0x3279, 0x327A, 0x3447, 0x3448),
    (0x3440, 0x3441, 0x3442, 0x3449, 0x344A),
];

/// `GL_TEXTURE_EXTERNAL_OES`
const GL_TEXTURE_EXTERNAL_OES: GLenum = 0x8D65;

const ATTR_INDEX_POS: GLuint = 0;
const ATTR_INDEX_TEXTURE: GLuint = 1;

type EglImageTargetTexture2DOes = unsafe extern "system" fn(GLenum, *const c_void);

/// Column-major 2×2 projection for each output transform
fn transform_matrix(transform: Transform) -> [f32; 4] {
    match transform {
        Transform::Normal => [1.0, 0.0, 0.0, 1.0],
        Transform::_90 => [0.0, 1.0, -1.0, 0.0],
        Transform::_180 => [-1.0, 0.0, 0.0, -1.0],
        Transform::_270 => [0.0, -1.0, 1.0, 0.0],
        Transform::Flipped => [-1.0, 0.0, 0.0, 1.0],
        Transform::Flipped90 => [0.0, 1.0, 1.0, 0.0],
        Transform::Flipped180 => [1.0, 0.0, 0.0, -1.0],
        Transform::Flipped270 => [0.0, -1.0, -1.0, 0.0],
        _ => [1.0, 0.0, 0.0, 1.0],
    }
}

/// Map a DRM FourCC to the matching GL upload format
pub fn gl_format_from_fourcc(fourcc: u32) -> Option<GLenum> {
    match fourcc {
        DRM_FORMAT_XRGB8888 | DRM_FORMAT_ARGB8888 => Some(gl::BGRA),
        DRM_FORMAT_XBGR8888 | DRM_FORMAT_ABGR8888 => Some(gl::RGBA),
        _ => None,
    }
}

/// Map a GL read format back to the DRM FourCC the RFB layer announces
pub fn fourcc_from_gl_format(format: GLenum) -> Option<u32> {
    match format {
        gl::BGRA => Some(DRM_FORMAT_XRGB8888),
        gl::RGBA => Some(DRM_FORMAT_XBGR8888),
        _ => None,
    }
}

struct ShaderProgram {
    program: GLuint,
    u_tex0: GLint,
    u_tex1: GLint,
    u_proj: GLint,
    u_flip_y: GLint,
}

struct Fbo {
    fbo: GLuint,
    tex: GLuint,
}

impl Fbo {
    fn new_textured(format: GLenum, width: u32, height: u32) -> Result<Self, RenderError> {
        unsafe {
            let mut tex = 0;
            gl::GenTextures(1, &mut tex);
            gl::BindTexture(gl::TEXTURE_2D, tex);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                format as GLint,
                width as GLint,
                height as GLint,
                0,
                format,
                gl::UNSIGNED_BYTE,
                ptr::null(),
            );
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as GLint);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as GLint);
            gl::TexParameteri(
                gl::TEXTURE_2D,
                gl::TEXTURE_WRAP_S,
                gl::CLAMP_TO_EDGE as GLint,
            );
            gl::TexParameteri(
                gl::TEXTURE_2D,
                gl::TEXTURE_WRAP_T,
                gl::CLAMP_TO_EDGE as GLint,
            );
            gl::BindTexture(gl::TEXTURE_2D, 0);

            let mut fbo = 0;
            gl::GenFramebuffers(1, &mut fbo);
            gl::BindFramebuffer(gl::FRAMEBUFFER, fbo);
            gl::FramebufferTexture2D(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                tex,
                0,
            );
            let status = gl::CheckFramebufferStatus(gl::FRAMEBUFFER);
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);

            if status != gl::FRAMEBUFFER_COMPLETE {
                gl::DeleteFramebuffers(1, &fbo);
                gl::DeleteTextures(1, &tex);
                return Err(RenderError::FramebufferIncomplete(status));
            }

            Ok(Self { fbo, tex })
        }
    }

    fn destroy(&mut self) {
        unsafe {
            gl::DeleteFramebuffers(1, &self.fbo);
            gl::DeleteTextures(1, &self.tex);
        }
    }
}

/// Offscreen renderer with damage estimation
pub struct Renderer {
    egl: EglInstance,
    display: egl::Display,
    context: egl::Context,
    image_target_texture: EglImageTargetTexture2DOes,

    width: u32,
    height: u32,
    proj: [f32; 4],

    frame_fbo: [Fbo; 2],
    frame_index: usize,
    have_last_texture: bool,

    damage_fbo: Fbo,
    tiles_w: u32,
    tiles_h: u32,
    tile_readback: Vec<u8>,
    last_damage: DamageRegion,

    texture_program: ShaderProgram,
    dmabuf_program: ShaderProgram,
    damage_program: ShaderProgram,

    read_format: GLenum,
    upload_format_override: Option<GLenum>,
}

impl Renderer {
    /// Initialise EGL, compile all shader programs and allocate the
    /// framebuffers for an output of `width × height` (post-transform)
    ///
    /// Any failure here is fatal for the server.
    pub fn new(
        width: u32,
        height: u32,
        transform: Transform,
        upload_format_override: Option<u32>,
    ) -> Result<Self, RenderError> {
        let egl = unsafe { EglInstance::load_required() }
            .map_err(|e| RenderError::LoadLibrary(e.to_string()))?;

        egl.bind_api(egl::OPENGL_ES_API)
            .map_err(|e| RenderError::Egl(e.to_string()))?;

        let display = unsafe {
            egl.get_platform_display(
                EGL_PLATFORM_SURFACELESS_MESA,
                ptr::null_mut(),
                &[egl::ATTRIB_NONE],
            )
        }
        .map_err(|e| RenderError::Egl(format!("get_platform_display: {}", e)))?;

        egl.initialize(display)
            .map_err(|e| RenderError::Egl(format!("initialize: {}", e)))?;

        let config_attrs = [
            egl::SURFACE_TYPE,
            0,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES2_BIT,
            egl::ALPHA_SIZE,
            8,
            egl::BLUE_SIZE,
            8,
            egl::GREEN_SIZE,
            8,
            egl::RED_SIZE,
            8,
            egl::NONE,
        ];
        let config = egl
            .choose_first_config(display, &config_attrs)
            .map_err(|e| RenderError::Egl(format!("choose_config: {}", e)))?
            .ok_or(RenderError::NoConfig)?;

        let context_attrs = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];
        let context = egl
            .create_context(display, config, None, &context_attrs)
            .map_err(|e| RenderError::Egl(format!("create_context: {}", e)))?;

        egl.make_current(display, None, None, Some(context))
            .map_err(|e| RenderError::Egl(format!("make_current: {}", e)))?;

        gl::load_with(|name| {
            egl.get_proc_address(name)
                .map(|f| f as *const c_void)
                .unwrap_or(ptr::null())
        });

        let image_target_texture: EglImageTargetTexture2DOes = unsafe {
            let f = egl
                .get_proc_address("glEGLImageTargetTexture2DOES")
                .ok_or(RenderError::Extension("glEGLImageTargetTexture2DOES"))?;
            std::mem::transmute(f)
        };

        unsafe {
            let version = gl::GetString(gl::VERSION);
            if !version.is_null() {
                debug!(
                    "GL version: {}",
                    std::ffi::CStr::from_ptr(version as *const _).to_string_lossy()
                );
            }
        }

        let tiles_w = width.div_ceil(TILE_SIZE);
        let tiles_h = height.div_ceil(TILE_SIZE);

        let frame_fbo = [
            Fbo::new_textured(gl::RGBA, width, height)?,
            Fbo::new_textured(gl::RGBA, width, height)?,
        ];
        let damage_fbo = Fbo::new_textured(gl::RGBA, tiles_w, tiles_h)?;

        let texture_program = compile_program(
            "texture",
            shaders::FRAME_VERTEX,
            shaders::TEXTURE_FRAGMENT,
        )?;
        let dmabuf_program =
            compile_program("dmabuf", shaders::FRAME_VERTEX, shaders::DMABUF_FRAGMENT)?;
        let damage_program = compile_program(
            "damage",
            shaders::DAMAGE_VERTEX,
            shaders::DAMAGE_FRAGMENT,
        )?;

        // The implementation read format depends on the bound framebuffer.
        let read_format = unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, frame_fbo[0].fbo);
            let mut format: GLint = 0;
            let mut ty: GLint = 0;
            gl::GetIntegerv(gl::IMPLEMENTATION_COLOR_READ_FORMAT, &mut format);
            gl::GetIntegerv(gl::IMPLEMENTATION_COLOR_READ_TYPE, &mut ty);
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);

            match (format as GLenum, ty as GLenum) {
                (gl::BGRA, gl::UNSIGNED_BYTE) => gl::BGRA,
                // RGBA/UNSIGNED_BYTE is always supported as a fallback.
                _ => gl::RGBA,
            }
        };

        info!(
            "renderer ready: {}x{}, {}x{} damage tiles, read format {:#x}",
            width, height, tiles_w, tiles_h, read_format
        );

        Ok(Self {
            egl,
            display,
            context,
            image_target_texture,
            width,
            height,
            proj: transform_matrix(transform),
            frame_fbo,
            frame_index: 0,
            have_last_texture: false,
            damage_fbo,
            tiles_w,
            tiles_h,
            tile_readback: vec![0; (tiles_w * tiles_h * 4) as usize],
            last_damage: DamageRegion::new(),
            texture_program,
            dmabuf_program,
            damage_program,
            read_format,
            upload_format_override: upload_format_override.and_then(gl_format_from_fourcc),
        })
    }

    /// Output width after transform
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Output height after transform
    pub fn height(&self) -> u32 {
        self.height
    }

    /// GL format used by [`Renderer::copy_pixels`]
    pub fn read_format(&self) -> GLenum {
        self.read_format
    }

    /// Damage region computed during the most recent upload
    pub fn current_damage(&self) -> &DamageRegion {
        &self.last_damage
    }

    /// Import a dma-buf frame, render it and update the damage region
    ///
    /// Consumes the frame; the plane fds are closed once the EGL image has
    /// been created over them.
    pub fn render_dmabuf_frame(&mut self, frame: DmabufFrame) -> Result<(), RenderError> {
        if frame.planes.is_empty() {
            return Err(RenderError::EmptyFrame);
        }

        let mut attrs: Vec<egl::Attrib> = Vec::with_capacity(6 + frame.planes.len() * 10 + 1);
        attrs.extend([egl::WIDTH as egl::Attrib, frame.width as egl::Attrib]);
        attrs.extend([egl::HEIGHT as egl::Attrib, frame.height as egl::Attrib]);
        attrs.extend([EGL_LINUX_DRM_FOURCC_EXT, frame.format as egl::Attrib]);

        for (plane, names) in frame.planes.iter().zip(PLANE_ATTRS) {
            let (fd_attr, offset_attr, pitch_attr, mod_lo, mod_hi) = names;
            attrs.extend([fd_attr, plane.fd.as_raw_fd() as egl::Attrib]);
            attrs.extend([offset_attr, plane.offset as egl::Attrib]);
            attrs.extend([pitch_attr, plane.pitch as egl::Attrib]);
            attrs.extend([mod_lo, (plane.modifier & 0xffff_ffff) as egl::Attrib]);
            attrs.extend([mod_hi, (plane.modifier >> 32) as egl::Attrib]);
        }
        attrs.push(egl::ATTRIB_NONE);

        let image = unsafe {
            self.egl.create_image(
                self.display,
                egl::Context::from_ptr(ptr::null_mut()),
                EGL_LINUX_DMA_BUF_EXT,
                egl::ClientBuffer::from_ptr(ptr::null_mut()),
                &attrs,
            )
        }
        .map_err(|e| RenderError::ImageImport(e.to_string()))?;

        unsafe {
            let mut tex = 0;
            gl::GenTextures(1, &mut tex);
            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(GL_TEXTURE_EXTERNAL_OES, tex);
            (self.image_target_texture)(GL_TEXTURE_EXTERNAL_OES, image.as_ptr());

            // The texture now references the image's storage; the image and
            // the plane fds can go.
            let _ = self.egl.destroy_image(self.display, image);
            drop(frame);

            self.draw_frame(&self.dmabuf_program, 1.0);
            gl::Finish();

            gl::BindTexture(GL_TEXTURE_EXTERNAL_OES, 0);
            gl::DeleteTextures(1, &tex);
        }

        self.estimate_damage();
        Ok(())
    }

    /// Upload host-memory pixels, render them and update the damage region
    ///
    /// `stride` is in bytes and may exceed `width * 4`; `flip_y` selects the
    /// vertical texture-coordinate flip for top-down sources.
    pub fn render_framebuffer(
        &mut self,
        pixels: &[u8],
        fourcc: u32,
        width: u32,
        height: u32,
        stride: u32,
        flip_y: bool,
    ) -> Result<(), RenderError> {
        let gl_format = match gl_format_from_fourcc(fourcc) {
            Some(f) => f,
            None => {
                let fallback = self.upload_format_override.unwrap_or(gl::BGRA);
                warn!(
                    "unknown wire format {:#010x}, uploading as {:#x}",
                    fourcc, fallback
                );
                fallback
            }
        };

        unsafe {
            let mut tex = 0;
            gl::GenTextures(1, &mut tex);
            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(gl::TEXTURE_2D, tex);

            gl::PixelStorei(gl::UNPACK_ROW_LENGTH, (stride / 4) as GLint);
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                gl_format as GLint,
                width as GLint,
                height as GLint,
                0,
                gl_format,
                gl::UNSIGNED_BYTE,
                pixels.as_ptr() as *const c_void,
            );
            gl::PixelStorei(gl::UNPACK_ROW_LENGTH, 0);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as GLint);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as GLint);
            gl::GenerateMipmap(gl::TEXTURE_2D);

            self.draw_frame(&self.texture_program, if flip_y { 1.0 } else { 0.0 });

            gl::BindTexture(gl::TEXTURE_2D, 0);
            gl::DeleteTextures(1, &tex);
        }

        self.estimate_damage();
        Ok(())
    }

    /// Read a horizontal band of the current frame into `dst`
    ///
    /// Pixels are written in the renderer's read format, four bytes per
    /// pixel, rows `y .. y + height`.
    pub fn copy_pixels(&mut self, dst: &mut [u8], y: u32, height: u32) {
        debug_assert!(y + height <= self.height);
        debug_assert!(dst.len() >= (self.width * height * 4) as usize);

        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, self.frame_fbo[self.frame_index].fbo);
            gl::Finish();
            gl::PixelStorei(gl::PACK_ALIGNMENT, 1);
            gl::ReadPixels(
                0,
                y as GLint,
                self.width as GLint,
                height as GLint,
                self.read_format,
                gl::UNSIGNED_BYTE,
                dst.as_mut_ptr() as *mut c_void,
            );
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
        }
    }

    /// Draw the bound source texture into the next frame framebuffer
    fn draw_frame(&self, program: &ShaderProgram, flip_y: f32) {
        // Switching the target first keeps the previous frame's texture
        // intact for the damage comparison.
        let target = &self.frame_fbo[self.frame_index ^ 1];

        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, target.fbo);
            gl::Viewport(0, 0, self.width as GLint, self.height as GLint);

            gl::UseProgram(program.program);
            gl::Uniform1i(program.u_tex0, 0);
            gl::Uniform1f(program.u_flip_y, flip_y);
            gl::UniformMatrix2fv(program.u_proj, 1, gl::FALSE, self.proj.as_ptr());

            draw_quad();

            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
        }
    }

    /// Compare the two frame textures and rebuild the damage region
    fn estimate_damage(&mut self) {
        let new_index = self.frame_index ^ 1;

        if !self.have_last_texture {
            // Nothing to diff against yet; the whole frame is new.
            self.frame_index = new_index;
            self.have_last_texture = true;
            self.last_damage = DamageRegion::full(self.width, self.height);
            return;
        }

        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, self.damage_fbo.fbo);
            gl::Viewport(0, 0, self.tiles_w as GLint, self.tiles_h as GLint);

            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(gl::TEXTURE_2D, self.frame_fbo[new_index].tex);
            gl::ActiveTexture(gl::TEXTURE1);
            gl::BindTexture(gl::TEXTURE_2D, self.frame_fbo[self.frame_index].tex);

            gl::UseProgram(self.damage_program.program);
            gl::Uniform1i(self.damage_program.u_tex0, 0);
            gl::Uniform1i(self.damage_program.u_tex1, 1);

            draw_quad();

            gl::Finish();
            gl::PixelStorei(gl::PACK_ALIGNMENT, 1);
            gl::ReadPixels(
                0,
                0,
                self.tiles_w as GLint,
                self.tiles_h as GLint,
                gl::RGBA,
                gl::UNSIGNED_BYTE,
                self.tile_readback.as_mut_ptr() as *mut c_void,
            );

            gl::ActiveTexture(gl::TEXTURE1);
            gl::BindTexture(gl::TEXTURE_2D, 0);
            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(gl::TEXTURE_2D, 0);
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
        }

        let flags: Vec<bool> = self
            .tile_readback
            .chunks_exact(4)
            .map(|px| px[0] != 0 || px[1] != 0 || px[2] != 0)
            .collect();

        self.last_damage = DamageRegion::from_tile_flags(&flags, self.tiles_w, self.tiles_h);
        self.frame_index = new_index;
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        unsafe {
            gl::DeleteProgram(self.texture_program.program);
            gl::DeleteProgram(self.dmabuf_program.program);
            gl::DeleteProgram(self.damage_program.program);
        }
        self.damage_fbo.destroy();
        self.frame_fbo[1].destroy();
        self.frame_fbo[0].destroy();

        let _ = self.egl.make_current(self.display, None, None, None);
        let _ = self.egl.destroy_context(self.display, self.context);
        let _ = self.egl.terminate(self.display);
    }
}

/// Draw a full-screen quad through the two vertex attributes
fn draw_quad() {
    static VERTICES: [[f32; 2]; 4] = [[-1.0, 1.0], [1.0, 1.0], [-1.0, -1.0], [1.0, -1.0]];
    static TEXCOORDS: [[f32; 2]; 4] = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];

    unsafe {
        gl::ClearColor(0.0, 0.0, 0.0, 1.0);
        gl::Clear(gl::COLOR_BUFFER_BIT);

        gl::VertexAttribPointer(
            ATTR_INDEX_POS,
            2,
            gl::FLOAT,
            gl::FALSE,
            0,
            VERTICES.as_ptr() as *const c_void,
        );
        gl::VertexAttribPointer(
            ATTR_INDEX_TEXTURE,
            2,
            gl::FLOAT,
            gl::FALSE,
            0,
            TEXCOORDS.as_ptr() as *const c_void,
        );

        gl::EnableVertexAttribArray(ATTR_INDEX_POS);
        gl::EnableVertexAttribArray(ATTR_INDEX_TEXTURE);

        gl::DrawArrays(gl::TRIANGLE_STRIP, 0, 4);

        gl::DisableVertexAttribArray(ATTR_INDEX_TEXTURE);
        gl::DisableVertexAttribArray(ATTR_INDEX_POS);
    }
}

fn compile_shader(
    name: &'static str,
    source: &str,
    kind: GLenum,
) -> Result<GLuint, RenderError> {
    unsafe {
        let shader = gl::CreateShader(kind);
        let ptr = source.as_ptr() as *const gl::types::GLchar;
        let len = source.len() as GLint;
        gl::ShaderSource(shader, 1, &ptr, &len);
        gl::CompileShader(shader);

        let mut compiled: GLint = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut compiled);
        if compiled == 0 {
            let log = shader_log(shader, false);
            gl::DeleteShader(shader);
            return Err(RenderError::ShaderCompile { name, log });
        }

        Ok(shader)
    }
}

fn compile_program(
    name: &'static str,
    vertex_src: &str,
    fragment_src: &str,
) -> Result<ShaderProgram, RenderError> {
    let vertex = compile_shader(name, vertex_src, gl::VERTEX_SHADER)?;
    let fragment = match compile_shader(name, fragment_src, gl::FRAGMENT_SHADER) {
        Ok(f) => f,
        Err(e) => {
            unsafe { gl::DeleteShader(vertex) };
            return Err(e);
        }
    };

    unsafe {
        let program = gl::CreateProgram();
        gl::AttachShader(program, vertex);
        gl::AttachShader(program, fragment);

        gl::BindAttribLocation(program, ATTR_INDEX_POS, c"pos".as_ptr());
        gl::BindAttribLocation(program, ATTR_INDEX_TEXTURE, c"texture".as_ptr());

        gl::LinkProgram(program);
        gl::DeleteShader(vertex);
        gl::DeleteShader(fragment);

        let mut linked: GLint = 0;
        gl::GetProgramiv(program, gl::LINK_STATUS, &mut linked);
        if linked == 0 {
            let log = shader_log(program, true);
            gl::DeleteProgram(program);
            return Err(RenderError::ProgramLink { name, log });
        }

        Ok(ShaderProgram {
            program,
            u_tex0: gl::GetUniformLocation(program, c"u_tex0".as_ptr()),
            u_tex1: gl::GetUniformLocation(program, c"u_tex1".as_ptr()),
            u_proj: gl::GetUniformLocation(program, c"u_proj".as_ptr()),
            u_flip_y: gl::GetUniformLocation(program, c"u_flip_y".as_ptr()),
        })
    }
}

fn shader_log(object: GLuint, is_program: bool) -> String {
    unsafe {
        let mut len: GLint = 0;
        if is_program {
            gl::GetProgramiv(object, gl::INFO_LOG_LENGTH, &mut len);
        } else {
            gl::GetShaderiv(object, gl::INFO_LOG_LENGTH, &mut len);
        }

        let mut buf = vec![0u8; len.max(1) as usize];
        let mut written: GLint = 0;
        if is_program {
            gl::GetProgramInfoLog(
                object,
                len,
                &mut written,
                buf.as_mut_ptr() as *mut gl::types::GLchar,
            );
        } else {
            gl::GetShaderInfoLog(
                object,
                len,
                &mut written,
                buf.as_mut_ptr() as *mut gl::types::GLchar,
            );
        }
        buf.truncate(written.max(0) as usize);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gl_format_from_fourcc() {
        assert_eq!(gl_format_from_fourcc(DRM_FORMAT_ARGB8888), Some(gl::BGRA));
        assert_eq!(gl_format_from_fourcc(DRM_FORMAT_XRGB8888), Some(gl::BGRA));
        assert_eq!(gl_format_from_fourcc(DRM_FORMAT_ABGR8888), Some(gl::RGBA));
        assert_eq!(gl_format_from_fourcc(DRM_FORMAT_XBGR8888), Some(gl::RGBA));
        assert_eq!(gl_format_from_fourcc(0x1234_5678), None);
    }

    #[test]
    fn test_fourcc_from_gl_format_roundtrip() {
        assert_eq!(fourcc_from_gl_format(gl::BGRA), Some(DRM_FORMAT_XRGB8888));
        assert_eq!(fourcc_from_gl_format(gl::RGBA), Some(DRM_FORMAT_XBGR8888));
        assert_eq!(fourcc_from_gl_format(gl::RGB), None);
    }

    #[test]
    fn test_transform_matrix_identity() {
        assert_eq!(transform_matrix(Transform::Normal), [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_transform_matrix_rotations_invert() {
        // Rotating by 90 then 270 composes to the identity.
        let a = transform_matrix(Transform::_90);
        let b = transform_matrix(Transform::_270);
        let product = [
            a[0] * b[0] + a[2] * b[1],
            a[1] * b[0] + a[3] * b[1],
            a[0] * b[2] + a[2] * b[3],
            a[1] * b[2] + a[3] * b[3],
        ];
        assert_eq!(product, [1.0, 0.0, 0.0, 1.0]);
    }
}
