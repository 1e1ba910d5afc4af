//! Embedded GLSL Programs
//!
//! Four small GLES2 shaders: a shared vertex stage drawing a full-screen
//! quad through the output transform, a plain 2D-sampler fragment stage for
//! shared-memory uploads, an external-image fragment stage for imported
//! dma-buf frames, and the damage stage comparing the two most recent frame
//! textures.

/// Vertex shader for frame rendering
///
/// `u_proj` carries the output transform; `u_flip_y` toggles the vertical
/// texture-coordinate flip that compensates for Y-inverted sources.
pub const FRAME_VERTEX: &str = "\
uniform mat2 u_proj;
uniform float u_flip_y;
attribute vec2 pos;
attribute vec2 texture;
varying vec2 v_texture;

void main() {
    v_texture = vec2(texture.s, mix(texture.t, 1.0 - texture.t, u_flip_y));
    gl_Position = vec4(u_proj * pos, 0.0, 1.0);
}
";

/// Fragment shader sampling an ordinary 2D texture
pub const TEXTURE_FRAGMENT: &str = "\
precision mediump float;
uniform sampler2D u_tex0;
varying vec2 v_texture;

void main() {
    gl_FragColor = texture2D(u_tex0, v_texture);
}
";

/// Fragment shader sampling an external image texture (dma-buf import)
pub const DMABUF_FRAGMENT: &str = "\
#extension GL_OES_EGL_image_external : require
precision mediump float;
uniform samplerExternalOES u_tex0;
varying vec2 v_texture;

void main() {
    gl_FragColor = texture2D(u_tex0, v_texture);
}
";

/// Vertex shader for the damage pass; no transform, no flip
pub const DAMAGE_VERTEX: &str = "\
attribute vec2 pos;
attribute vec2 texture;
varying vec2 v_texture;

void main() {
    v_texture = texture;
    gl_Position = vec4(pos, 0.0, 1.0);
}
";

/// Fragment shader writing non-zero iff the two samples differ
pub const DAMAGE_FRAGMENT: &str = "\
precision mediump float;
uniform sampler2D u_tex0;
uniform sampler2D u_tex1;
varying vec2 v_texture;

void main() {
    vec4 diff = abs(texture2D(u_tex0, v_texture) - texture2D(u_tex1, v_texture));
    float changed = step(0.5 / 255.0, diff.r + diff.g + diff.b + diff.a);
    gl_FragColor = vec4(changed, changed, changed, 1.0);
}
";
