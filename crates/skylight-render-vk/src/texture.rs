// SPDX-License-Identifier: CEPL-1.0
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use ash::vk;
use tracing::info;

use crate::context::DeviceContext;
use crate::handles::Guard;
use crate::utils::{self, ImageAlloc, ImageDesc};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureKind {
    Tex2D,
    Cube,
}

/// Bytes per texel for the uncompressed formats the engine uploads or reads back.
pub fn format_texel_size(format: vk::Format) -> Option<usize> {
    match format {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// Size of `mip` for a base dimension.
#[inline]
pub fn mip_dimension(base: u32, mip: u32) -> u32 {
    (base >> mip).max(1)
}

/// Sampled image with a view and sampler. Always in SHADER_READ_ONLY between calls.
pub struct Texture {
    ctx: Arc<DeviceContext>,
    alloc: ImageAlloc,
    view: vk::ImageView,
    sampler: vk::Sampler,
    desc: ImageDesc,
    kind: TextureKind,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("alloc", &self.alloc)
            .field("view", &self.view)
            .field("sampler", &self.sampler)
            .field("desc", &self.desc)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

struct Decoded {
    width: u32,
    height: u32,
    format: vk::Format,
    bytes: Vec<u8>,
    mipmapped: bool,
}

fn decode(path: &Path) -> Result<Decoded> {
    let img = image::open(path).with_context(|| format!("decoding {}", path.display()))?;
    let hdr = matches!(
        img.color(),
        image::ColorType::Rgb32F | image::ColorType::Rgba32F
    );
    let (width, height) = (img.width(), img.height());
    if hdr {
        let pixels = img.to_rgba32f().into_raw();
        Ok(Decoded {
            width,
            height,
            format: vk::Format::R32G32B32A32_SFLOAT,
            bytes: bytemuck::cast_slice(&pixels).to_vec(),
            mipmapped: false,
        })
    } else {
        Ok(Decoded {
            width,
            height,
            format: vk::Format::R8G8B8A8_UNORM,
            bytes: img.to_rgba8().into_raw(),
            mipmapped: true,
        })
    }
}

impl Texture {
    /// LDR files become mipmapped RGBA8; Radiance `.hdr` files become a single-level
    /// RGBA32F image.
    pub fn load_from_file(ctx: Arc<DeviceContext>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let d = decode(path)?;
        let mut tex = Self::from_pixels(ctx, d.width, d.height, d.format, &d.bytes, d.mipmapped)?;
        tex.path = Some(path.to_path_buf());
        info!(
            "loaded texture {} ({}x{}, {:?}, {} mips)",
            path.display(),
            d.width,
            d.height,
            d.format,
            tex.desc.mip_levels
        );
        Ok(tex)
    }

    pub fn from_pixels(
        ctx: Arc<DeviceContext>,
        width: u32,
        height: u32,
        format: vk::Format,
        pixels: &[u8],
        mipmapped: bool,
    ) -> Result<Self> {
        let texel = format_texel_size(format).ok_or_else(|| anyhow!("unsupported upload format {format:?}"))?;
        let expected = width as usize * height as usize * texel;
        if pixels.len() != expected {
            bail!("pixel data is {} bytes, expected {expected}", pixels.len());
        }
        let mips = if mipmapped {
            utils::mip_levels_for(width, height)
        } else {
            1
        };
        let desc = ImageDesc::new_2d(width, height, format, Self::usage_for(TextureKind::Tex2D)).with_mips(mips);
        Self::create(ctx, desc, TextureKind::Tex2D, Some(pixels))
    }

    /// Empty cube with `mip_levels` levels, meant as a render target for cube bakes.
    pub fn create_cube(
        ctx: Arc<DeviceContext>,
        size: u32,
        format: vk::Format,
        mip_levels: u32,
    ) -> Result<Self> {
        let desc = ImageDesc::new_cube(size, format, Self::usage_for(TextureKind::Cube)).with_mips(mip_levels.max(1));
        Self::create(ctx, desc, TextureKind::Cube, None)
    }

    fn usage_for(kind: TextureKind) -> vk::ImageUsageFlags {
        let base = vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
        match kind {
            TextureKind::Tex2D => base,
            TextureKind::Cube => base | vk::ImageUsageFlags::COLOR_ATTACHMENT,
        }
    }

    fn create(
        ctx: Arc<DeviceContext>,
        desc: ImageDesc,
        kind: TextureKind,
        pixels: Option<&[u8]>,
    ) -> Result<Self> {
        let device = ctx.device();
        let full = utils::subresource_range(
            vk::ImageAspectFlags::COLOR,
            0,
            desc.mip_levels,
            0,
            desc.array_layers,
        );

        let image = Guard::new(device, unsafe {
            utils::create_image(&ctx, &desc, vk::MemoryPropertyFlags::DEVICE_LOCAL)?
        });
        let img = image.get().image;

        unsafe {
            utils::transition_image_layout(
                &ctx,
                img,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                full,
            )?;
            if let Some(bytes) = pixels {
                let staging = Guard::new(device, utils::create_staging_buffer(&ctx, bytes)?);
                utils::copy_buffer_to_image(
                    &ctx,
                    staging.get().buffer,
                    img,
                    desc.width,
                    desc.height,
                    desc.array_layers,
                )?;
            }
            utils::generate_mipmaps(
                &ctx,
                img,
                desc.format,
                desc.width,
                desc.height,
                desc.mip_levels,
                desc.array_layers,
            )?;
        }

        let view_type = match kind {
            TextureKind::Tex2D => vk::ImageViewType::TYPE_2D,
            TextureKind::Cube => vk::ImageViewType::CUBE,
        };
        let view = Guard::new(device, unsafe {
            utils::create_image_view(device, img, view_type, desc.format, full)?
        });
        let sampler = Guard::new(device, unsafe {
            utils::create_sampler(
                &ctx,
                desc.format,
                desc.mip_levels,
                vk::SamplerAddressMode::REPEAT,
            )?
        });

        let (alloc, view, sampler) = (image.keep(), view.keep(), sampler.keep());
        Ok(Self {
            ctx,
            alloc,
            view,
            sampler,
            desc,
            kind,
            path: None,
        })
    }

    /// Re-reads the source file. The current texture stays valid if that fails.
    ///
    /// On success the old image, view and sampler are destroyed after the
    /// device goes idle, so descriptor sets that referenced them must be
    /// written again before their next use.
    pub fn reload(&mut self) -> Result<()> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| anyhow!("texture was not loaded from a file"))?;
        let fresh = Self::load_from_file(self.ctx.clone(), path)?;
        self.ctx.wait_idle()?;
        *self = fresh;
        Ok(())
    }

    /// Copies one layer of one mip level back to host memory, tightly packed.
    pub fn read_back(&self, layer: u32, mip: u32) -> Result<Vec<u8>> {
        if layer >= self.desc.array_layers || mip >= self.desc.mip_levels {
            bail!(
                "layer {layer} / mip {mip} out of range ({} layers, {} mips)",
                self.desc.array_layers,
                self.desc.mip_levels
            );
        }
        let texel = format_texel_size(self.desc.format)
            .ok_or_else(|| anyhow!("cannot read back {:?}", self.desc.format))?;
        let (w, h) = (
            mip_dimension(self.desc.width, mip),
            mip_dimension(self.desc.height, mip),
        );
        let len = w as usize * h as usize * texel;

        let ctx = &*self.ctx;
        let device = ctx.device();
        let range = utils::subresource_range(vk::ImageAspectFlags::COLOR, mip, 1, layer, 1);
        unsafe {
            let host = Guard::new(
                device,
                utils::create_buffer(
                    ctx,
                    len as vk::DeviceSize,
                    vk::BufferUsageFlags::TRANSFER_DST,
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )?,
            );
            utils::transition_image_layout(
                ctx,
                self.alloc.image,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                range,
            )?;
            let copied = utils::copy_image_to_buffer(ctx, self.alloc.image, mip, layer, w, h, host.get().buffer);
            utils::transition_image_layout(
                ctx,
                self.alloc.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                range,
            )?;
            copied.context("copying texture to host")?;
            utils::read_host_visible(device, host.get().memory, len)
        }
    }

    #[inline]
    pub fn image(&self) -> vk::Image {
        self.alloc.image
    }
    #[inline]
    pub fn view(&self) -> vk::ImageView {
        self.view
    }
    #[inline]
    pub fn sampler(&self) -> vk::Sampler {
        self.sampler
    }
    #[inline]
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }
    #[inline]
    pub fn width(&self) -> u32 {
        self.desc.width
    }
    #[inline]
    pub fn height(&self) -> u32 {
        self.desc.height
    }
    #[inline]
    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }
    #[inline]
    pub fn layer_count(&self) -> u32 {
        self.desc.array_layers
    }
    #[inline]
    pub fn kind(&self) -> TextureKind {
        self.kind
    }
    #[inline]
    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.desc.usage
    }
    #[inline]
    pub fn create_flags(&self) -> vk::ImageCreateFlags {
        self.desc.flags
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

// STRICT TEARDOWN ORDER: sampler and view before the image they reference.
impl Drop for Texture {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.alloc.image, None);
            device.free_memory(self.alloc.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texel_sizes() {
        assert_eq!(format_texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(format_texel_size(vk::Format::R16G16B16A16_SFLOAT), Some(8));
        assert_eq!(format_texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(format_texel_size(vk::Format::BC7_UNORM_BLOCK), None);
    }

    #[test]
    fn mip_dimensions_stop_at_one() {
        assert_eq!(mip_dimension(256, 0), 256);
        assert_eq!(mip_dimension(256, 3), 32);
        assert_eq!(mip_dimension(256, 8), 1);
        assert_eq!(mip_dimension(300, 9), 1);
        assert_eq!(mip_dimension(5, 1), 2);
    }

    #[test]
    fn cube_textures_can_be_render_targets() {
        assert!(Texture::usage_for(TextureKind::Cube).contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
        assert!(!Texture::usage_for(TextureKind::Tex2D).contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));
    }
}
