// SPDX-License-Identifier: CEPL-1.0
//! Graphics pipeline construction shared by the cube baker and the renderer.
use anyhow::{anyhow, Result};
use ash::vk;

use crate::mesh::Vertex;
use crate::shader::Shader;

/// How a pipeline consumes [`Vertex`] data.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VertexLayout {
    /// Location 0 only.
    PositionOnly,
    /// Every attribute of [`Vertex`].
    Full,
}

#[derive(Clone, Copy, Debug)]
pub struct DepthState {
    pub test: bool,
    pub write: bool,
    pub compare: vk::CompareOp,
}

impl DepthState {
    pub const DISABLED: Self = Self {
        test: false,
        write: false,
        compare: vk::CompareOp::ALWAYS,
    };
    pub const LESS: Self = Self {
        test: true,
        write: true,
        compare: vk::CompareOp::LESS,
    };
    /// Always passes and leaves the depth buffer alone (background geometry).
    pub const BACKGROUND: Self = Self {
        test: true,
        write: false,
        compare: vk::CompareOp::ALWAYS,
    };
}

pub struct GraphicsPipelineDesc<'a> {
    pub vertex: &'a Shader,
    pub fragment: &'a Shader,
    pub vertex_layout: VertexLayout,
    pub cull_mode: vk::CullModeFlags,
    pub depth: DepthState,
    pub samples: vk::SampleCountFlags,
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
}

pub unsafe fn create_pipeline_layout(
    device: &ash::Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constants: &[vk::PushConstantRange],
) -> Result<vk::PipelineLayout> {
    let ci = vk::PipelineLayoutCreateInfo {
        s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
        set_layout_count: set_layouts.len() as u32,
        p_set_layouts: set_layouts.as_ptr(),
        push_constant_range_count: push_constants.len() as u32,
        p_push_constant_ranges: push_constants.as_ptr(),
        ..Default::default()
    };
    Ok(unsafe { device.create_pipeline_layout(&ci, None)? })
}

/// Viewport and scissor are dynamic; every pipeline has one color attachment.
pub unsafe fn create_graphics_pipeline(
    device: &ash::Device,
    desc: &GraphicsPipelineDesc<'_>,
) -> Result<vk::Pipeline> {
    let stages = [desc.vertex.stage_info(), desc.fragment.stage_info()];

    let binding = Vertex::binding_description();
    let attributes = Vertex::attribute_descriptions();
    let attribute_count = match desc.vertex_layout {
        VertexLayout::PositionOnly => 1,
        VertexLayout::Full => attributes.len(),
    };
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &binding,
        vertex_attribute_description_count: attribute_count as u32,
        p_vertex_attribute_descriptions: attributes.as_ptr(),
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: vk::PrimitiveTopology::TRIANGLE_LIST,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: vk::PolygonMode::FILL,
        cull_mode: desc.cull_mode,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: 1.0,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: desc.samples,
        ..Default::default()
    };
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DEPTH_STENCIL_STATE_CREATE_INFO,
        depth_test_enable: desc.depth.test.into(),
        depth_write_enable: desc.depth.write.into(),
        depth_compare_op: desc.depth.compare,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_depth_stencil_state: &depth_stencil,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout: desc.layout,
        render_pass: desc.render_pass,
        subpass: 0,
        ..Default::default()
    };

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), std::slice::from_ref(&info), None)
    }
    .map_err(|(_, err)| anyhow!("create_graphics_pipelines failed: {err:?}"))?;
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("create_graphics_pipelines returned nothing"))
}
