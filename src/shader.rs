// src/shader.rs
//! Shader sets: loading, compiling and hot reload.
//!
//! A shader set is a vertex + fragment pair named `<set>.vert.wgsl` /
//! `<set>.frag.wgsl`. Each set is compiled once per surface into a
//! [`PipelineSet`] (one pipeline per draw kind) and cached by name.
//!
//! Reload keeps the running pipelines unless the new source compiles: a
//! broken edit logs the diagnostic and the previous `Arc` stays in the cache.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use crate::binding::BindingLayout;
use crate::error::{Error, Result};
use crate::mesh::Vertex;
use crate::preprocess::preprocess;

// ============================================================================
// 1. SOURCES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    pub vertex: String,
    pub fragment: String,
}

impl ShaderSource {
    pub fn content_hash(&self) -> u64 {
        let mut bytes = Vec::with_capacity(self.vertex.len() + self.fragment.len() + 1);
        bytes.extend_from_slice(self.vertex.as_bytes());
        bytes.push(0);
        bytes.extend_from_slice(self.fragment.as_bytes());
        xxh3_64(&bytes)
    }
}

/// Produces preprocessed source for a shader set.
pub trait ShaderLoader {
    fn load(&self, name: &str, prelude: &[String]) -> Result<ShaderSource>;
}

/// Reads `<root>/<name>.vert.wgsl` and `<root>/<name>.frag.wgsl`, falling
/// back to sources registered in memory. Files win so built-in sets can be
/// overridden and edited live.
pub struct FileShaderLoader {
    root: PathBuf,
    builtins: HashMap<String, ShaderSource>,
    includes: HashMap<String, String>,
}

impl FileShaderLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let mut loader = Self {
            root: root.into(),
            builtins: HashMap::new(),
            includes: HashMap::new(),
        };
        loader.add_include("lights.wgsl", crate::lighting::LIGHTS_WGSL);
        loader.add_include("fields.wgsl", crate::influence::FIELDS_WGSL);
        loader
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn add_builtin(&mut self, name: &str, vertex: &str, fragment: &str) {
        self.builtins.insert(
            name.to_string(),
            ShaderSource {
                vertex: vertex.to_string(),
                fragment: fragment.to_string(),
            },
        );
    }

    pub fn add_include(&mut self, name: &str, source: &str) {
        self.includes.insert(name.to_string(), source.to_string());
    }

    fn stage(&self, name: &str, stage: &'static str) -> Result<String> {
        let path = self.root.join(format!("{name}.{}.wgsl", stage_suffix(stage)));
        match std::fs::read_to_string(&path) {
            Ok(source) => return Ok(source),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::Io(err).context(format!("reading {}", path.display()))),
        }

        self.builtins
            .get(name)
            .map(|b| if stage == "vertex" { b.vertex.clone() } else { b.fragment.clone() })
            .ok_or_else(|| Error::MissingShaderStage {
                shader: name.to_string(),
                stage,
            })
    }

    fn resolve_include(&self, name: &str) -> Result<String> {
        if let Some(source) = self.includes.get(name) {
            return Ok(source.clone());
        }
        let path = self.root.join(name);
        std::fs::read_to_string(&path)
            .map_err(|err| Error::Preprocess(format!("include `{}`: {err}", path.display())))
    }
}

fn stage_suffix(stage: &str) -> &'static str {
    if stage == "vertex" {
        "vert"
    } else {
        "frag"
    }
}

impl ShaderLoader for FileShaderLoader {
    fn load(&self, name: &str, prelude: &[String]) -> Result<ShaderSource> {
        let includes = |include: &str| self.resolve_include(include);
        let vertex = self.stage(name, "vertex")?;
        let fragment = self.stage(name, "fragment")?;
        Ok(ShaderSource {
            vertex: preprocess(&vertex, prelude, &includes)?,
            fragment: preprocess(&fragment, prelude, &includes)?,
        })
    }
}

// ============================================================================
// 2. CACHE
// ============================================================================

/// What the GPU made of a build. Native builds are judged before
/// [`ShaderCompiler::compile`] returns; browsers deliver the verdict later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pending,
    Valid,
    Invalid(String),
}

/// Shared slot the verdict for one build lands in.
#[derive(Debug, Clone)]
pub struct Validation(Arc<Mutex<Verdict>>);

impl Validation {
    pub fn valid() -> Self {
        Self(Arc::new(Mutex::new(Verdict::Valid)))
    }

    pub fn pending() -> Self {
        Self(Arc::new(Mutex::new(Verdict::Pending)))
    }

    /// `None` means no validation error was reported.
    pub fn settle(&self, diagnostic: Option<String>) {
        *self.0.lock() = match diagnostic {
            None => Verdict::Valid,
            Some(diagnostic) => Verdict::Invalid(diagnostic),
        };
    }

    pub fn verdict(&self) -> Verdict {
        self.0.lock().clone()
    }

    pub fn is_valid(&self) -> bool {
        *self.0.lock() == Verdict::Valid
    }
}

pub struct Compiled<P> {
    pub output: P,
    pub validation: Validation,
}

impl<P> Compiled<P> {
    pub fn valid(output: P) -> Self {
        Self {
            output,
            validation: Validation::valid(),
        }
    }
}

/// Turns source into whatever the renderer draws with.
pub trait ShaderCompiler {
    type Output;

    fn compile(&self, name: &str, layout: &BindingLayout, source: &ShaderSource) -> Result<Compiled<Self::Output>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Reloaded,
    /// Source is byte-identical to what is running.
    Unchanged,
    /// Loading or compiling failed; the previous build is still active.
    KeptPrevious,
    /// Built, but the GPU has not judged it yet. The previous build stays
    /// active until [`ShaderCache::settle_pending`] sees a verdict.
    Validating,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub reloaded: usize,
    pub unchanged: usize,
    pub validating: usize,
    /// Sets whose new source was rejected.
    pub kept: Vec<String>,
}

impl ReloadSummary {
    fn record(&mut self, name: &str, outcome: ReloadOutcome) {
        match outcome {
            ReloadOutcome::Reloaded => self.reloaded += 1,
            ReloadOutcome::Unchanged => self.unchanged += 1,
            ReloadOutcome::Validating => self.validating += 1,
            ReloadOutcome::KeptPrevious => self.kept.push(name.to_string()),
        }
    }

    /// Whether any set was swapped or rejected.
    pub fn has_verdicts(&self) -> bool {
        self.reloaded > 0 || !self.kept.is_empty()
    }
}

struct PendingBuild<P> {
    build: P,
    hash: u64,
    validation: Validation,
}

struct CacheEntry<P> {
    active: Arc<P>,
    pending: Option<PendingBuild<P>>,
    layout: BindingLayout,
    defines: Vec<String>,
    source_hash: u64,
    last_error: Option<String>,
}

impl<P> CacheEntry<P> {
    fn prelude(&self) -> Vec<String> {
        let mut prelude = self.layout.prelude();
        prelude.extend(self.defines.iter().cloned());
        prelude
    }

    fn reject(&mut self, name: &str, diagnostic: String) -> ReloadOutcome {
        log::error!("keeping previous build of shader set `{name}`: {diagnostic}");
        self.last_error = Some(diagnostic);
        ReloadOutcome::KeptPrevious
    }

    /// Apply the verdict on the staged build, if one has arrived.
    fn settle(&mut self, name: &str) -> Option<ReloadOutcome> {
        let verdict = self.pending.as_ref()?.validation.verdict();
        match verdict {
            Verdict::Pending => None,
            Verdict::Valid => {
                let pending = self.pending.take()?;
                self.active = Arc::new(pending.build);
                self.source_hash = pending.hash;
                self.last_error = None;
                log::info!("reloaded shader set `{name}`");
                Some(ReloadOutcome::Reloaded)
            }
            Verdict::Invalid(diagnostic) => {
                self.pending = None;
                Some(self.reject(name, diagnostic))
            }
        }
    }
}

pub struct ShaderCache<P> {
    entries: BTreeMap<String, CacheEntry<P>>,
}

impl<P> Default for ShaderCache<P> {
    fn default() -> Self {
        Self { entries: BTreeMap::new() }
    }
}

impl<P> ShaderCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<P>> {
        self.entries.get(name).map(|e| e.active.clone())
    }

    pub fn layout(&self, name: &str) -> Option<&BindingLayout> {
        self.entries.get(name).map(|e| &e.layout)
    }

    pub fn last_error(&self, name: &str) -> Option<&str> {
        self.entries.get(name).and_then(|e| e.last_error.as_deref())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Build `name` on first request. Creation failures are returned to the
    /// caller; there is nothing to fall back to yet, so a build still
    /// awaiting its verdict is used as is.
    pub fn get_or_create<L, C>(
        &mut self,
        name: &str,
        layout: &BindingLayout,
        defines: &[String],
        loader: &L,
        compiler: &C,
    ) -> Result<Arc<P>>
    where
        L: ShaderLoader + ?Sized,
        C: ShaderCompiler<Output = P> + ?Sized,
    {
        if let Some(entry) = self.entries.get(name) {
            if &entry.layout != layout {
                return Err(Error::LayoutMismatch { shader: name.to_string() });
            }
            return Ok(entry.active.clone());
        }

        let mut prelude = layout.prelude();
        prelude.extend(defines.iter().cloned());
        let source = loader.load(name, &prelude)?;
        let compiled = compiler.compile(name, layout, &source)?;
        if let Verdict::Invalid(diagnostic) = compiled.validation.verdict() {
            return Err(Error::ShaderCompile {
                shader: name.to_string(),
                diagnostic,
            });
        }
        let active = Arc::new(compiled.output);
        log::info!("compiled shader set `{name}`");

        self.entries.insert(
            name.to_string(),
            CacheEntry {
                active: active.clone(),
                pending: None,
                layout: layout.clone(),
                defines: defines.to_vec(),
                source_hash: source.content_hash(),
                last_error: None,
            },
        );
        Ok(active)
    }

    pub fn reload<L, C>(&mut self, name: &str, loader: &L, compiler: &C) -> Option<ReloadOutcome>
    where
        L: ShaderLoader + ?Sized,
        C: ShaderCompiler<Output = P> + ?Sized,
    {
        let entry = self.entries.get_mut(name)?;

        let source = match loader.load(name, &entry.prelude()) {
            Ok(source) => source,
            Err(err) => return Some(entry.reject(name, err.to_string())),
        };
        let hash = source.content_hash();
        if hash == entry.source_hash {
            entry.pending = None;
            return Some(ReloadOutcome::Unchanged);
        }
        if entry.pending.as_ref().is_some_and(|p| p.hash == hash) {
            return Some(ReloadOutcome::Validating);
        }

        match compiler.compile(name, &entry.layout, &source) {
            Ok(compiled) => {
                entry.pending = Some(PendingBuild {
                    build: compiled.output,
                    hash,
                    validation: compiled.validation,
                });
                Some(entry.settle(name).unwrap_or(ReloadOutcome::Validating))
            }
            Err(err) => Some(entry.reject(name, err.to_string())),
        }
    }

    pub fn reload_all<L, C>(&mut self, loader: &L, compiler: &C) -> ReloadSummary
    where
        L: ShaderLoader + ?Sized,
        C: ShaderCompiler<Output = P> + ?Sized,
    {
        let names: Vec<String> = self.entries.keys().cloned().collect();
        let mut summary = ReloadSummary::default();
        for name in names {
            if let Some(outcome) = self.reload(&name, loader, compiler) {
                summary.record(&name, outcome);
            }
        }
        summary
    }

    /// Promote or drop staged builds whose verdict has arrived.
    pub fn settle_pending(&mut self) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        for (name, entry) in &mut self.entries {
            match entry.settle(name) {
                Some(outcome) => summary.record(name, outcome),
                None if entry.pending.is_some() => summary.validating += 1,
                None => {}
            }
        }
        summary
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<P>> {
        self.entries.remove(name).map(|e| e.active)
    }
}

// ============================================================================
// 3. WGPU PIPELINES
// ============================================================================

/// One pipeline per primitive / blend combination a shader set is drawn with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Triangles,
    Lines,
    /// Line strips. Also used for wireframe.
    Curves,
    NoCull,
    AlphaBlend,
    Additive,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 6] = [
        PipelineKind::Triangles,
        PipelineKind::Lines,
        PipelineKind::Curves,
        PipelineKind::NoCull,
        PipelineKind::AlphaBlend,
        PipelineKind::Additive,
    ];

    fn index(self) -> usize {
        self as usize
    }

    fn primitive(self) -> wgpu::PrimitiveState {
        let (topology, cull_mode) = match self {
            PipelineKind::Triangles | PipelineKind::AlphaBlend | PipelineKind::Additive => {
                (wgpu::PrimitiveTopology::TriangleList, Some(wgpu::Face::Back))
            }
            PipelineKind::NoCull => (wgpu::PrimitiveTopology::TriangleList, None),
            PipelineKind::Lines => (wgpu::PrimitiveTopology::LineList, None),
            PipelineKind::Curves => (wgpu::PrimitiveTopology::LineStrip, None),
        };
        wgpu::PrimitiveState {
            topology,
            strip_index_format: (topology == wgpu::PrimitiveTopology::LineStrip).then_some(wgpu::IndexFormat::Uint32),
            front_face: wgpu::FrontFace::Ccw,
            cull_mode,
            ..Default::default()
        }
    }

    fn blend(self) -> Option<wgpu::BlendState> {
        match self {
            PipelineKind::AlphaBlend => Some(wgpu::BlendState::ALPHA_BLENDING),
            PipelineKind::Additive => {
                let add = wgpu::BlendComponent {
                    src_factor: wgpu::BlendFactor::One,
                    dst_factor: wgpu::BlendFactor::One,
                    operation: wgpu::BlendOperation::Add,
                };
                Some(wgpu::BlendState { color: add, alpha: add })
            }
            _ => Some(wgpu::BlendState::REPLACE),
        }
    }

    fn writes_depth(self) -> bool {
        !matches!(self, PipelineKind::AlphaBlend | PipelineKind::Additive)
    }
}

pub struct PipelineSet {
    name: String,
    bind_group_layout: Arc<wgpu::BindGroupLayout>,
    pipelines: [wgpu::RenderPipeline; 6],
}

impl PipelineSet {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable across reloads of the same set, so existing bind groups stay valid.
    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.bind_group_layout
    }

    pub fn pipeline(&self, kind: PipelineKind) -> &wgpu::RenderPipeline {
        &self.pipelines[kind.index()]
    }
}

pub struct WgpuShaderCompiler {
    device: Arc<wgpu::Device>,
    color_format: wgpu::TextureFormat,
    depth_format: wgpu::TextureFormat,
    layouts: Mutex<HashMap<BindingLayout, Arc<wgpu::BindGroupLayout>>>,
}

impl WgpuShaderCompiler {
    pub fn new(device: Arc<wgpu::Device>, color_format: wgpu::TextureFormat, depth_format: wgpu::TextureFormat) -> Self {
        Self {
            device,
            color_format,
            depth_format,
            layouts: Mutex::new(HashMap::new()),
        }
    }

    fn bind_group_layout(&self, name: &str, layout: &BindingLayout) -> Arc<wgpu::BindGroupLayout> {
        self.layouts
            .lock()
            .entry(layout.clone())
            .or_insert_with(|| Arc::new(layout.create_bind_group_layout(&self.device, &format!("{name}_bgl"))))
            .clone()
    }

    fn build_pipeline(
        &self,
        name: &str,
        kind: PipelineKind,
        pipeline_layout: &wgpu::PipelineLayout,
        vertex: &wgpu::ShaderModule,
        fragment: &wgpu::ShaderModule,
    ) -> wgpu::RenderPipeline {
        self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&format!("{name}_{kind:?}")),
            layout: Some(pipeline_layout),
            vertex: wgpu::VertexState {
                module: vertex,
                entry_point: "vs_main",
                buffers: &[Vertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: fragment,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: self.color_format,
                    blend: kind.blend(),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: kind.primitive(),
            depth_stencil: Some(wgpu::DepthStencilState {
                format: self.depth_format,
                depth_write_enabled: kind.writes_depth(),
                depth_compare: wgpu::CompareFunction::Less,
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        })
    }
}

impl ShaderCompiler for WgpuShaderCompiler {
    type Output = PipelineSet;

    fn compile(&self, name: &str, layout: &BindingLayout, source: &ShaderSource) -> Result<Compiled<PipelineSet>> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let vertex = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&format!("{name}.vert")),
            source: wgpu::ShaderSource::Wgsl(source.vertex.as_str().into()),
        });
        let fragment = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(&format!("{name}.frag")),
            source: wgpu::ShaderSource::Wgsl(source.fragment.as_str().into()),
        });

        let bind_group_layout = self.bind_group_layout(name, layout);
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{name}_layout")),
            bind_group_layouts: &[bind_group_layout.as_ref()],
            push_constant_ranges: &[],
        });

        let pipelines = PipelineKind::ALL.map(|kind| self.build_pipeline(name, kind, &pipeline_layout, &vertex, &fragment));

        let validation = finish_validation(&self.device, name)?;

        Ok(Compiled {
            output: PipelineSet {
                name: name.to_string(),
                bind_group_layout,
                pipelines,
            },
            validation,
        })
    }
}

/// Pop the validation scope pushed before building `shader`'s GPU objects.
/// Natively this blocks until the verdict is known.
#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn finish_validation(device: &wgpu::Device, shader: &str) -> Result<Validation> {
    if let Some(err) = pollster::block_on(device.pop_error_scope()) {
        return Err(Error::ShaderCompile {
            shader: shader.to_string(),
            diagnostic: err.to_string(),
        });
    }
    Ok(Validation::valid())
}

/// Browsers report late: the returned [`Validation`] stays pending until the
/// popped scope resolves.
#[cfg(target_arch = "wasm32")]
pub(crate) fn finish_validation(device: &wgpu::Device, shader: &str) -> Result<Validation> {
    let scope = device.pop_error_scope();
    let validation = Validation::pending();
    let verdict = validation.clone();
    let shader = shader.to_string();
    wasm_bindgen_futures::spawn_local(async move {
        let diagnostic = scope.await.map(|err| err.to_string());
        if let Some(diagnostic) = &diagnostic {
            log::error!("shader `{shader}` failed validation: {diagnostic}");
        }
        verdict.settle(diagnostic);
    });
    Ok(validation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[derive(Default)]
    struct MemoryLoader {
        sources: RefCell<HashMap<String, ShaderSource>>,
    }

    impl MemoryLoader {
        fn set(&self, name: &str, fragment: &str) {
            self.sources.borrow_mut().insert(
                name.to_string(),
                ShaderSource {
                    vertex: "fn vs_main() {}".to_string(),
                    fragment: fragment.to_string(),
                },
            );
        }
    }

    impl ShaderLoader for MemoryLoader {
        fn load(&self, name: &str, _prelude: &[String]) -> Result<ShaderSource> {
            self.sources.borrow().get(name).cloned().ok_or_else(|| Error::MissingShaderStage {
                shader: name.to_string(),
                stage: "vertex",
            })
        }
    }

    /// Rejects any fragment containing `syntax error`.
    #[derive(Default)]
    struct FakeCompiler {
        builds: Cell<usize>,
    }

    impl ShaderCompiler for FakeCompiler {
        type Output = String;

        fn compile(&self, name: &str, _layout: &BindingLayout, source: &ShaderSource) -> Result<Compiled<String>> {
            self.builds.set(self.builds.get() + 1);
            if source.fragment.contains("syntax error") {
                return Err(Error::ShaderCompile {
                    shader: name.to_string(),
                    diagnostic: "unexpected token".to_string(),
                });
            }
            Ok(Compiled::valid(source.fragment.clone()))
        }
    }

    /// Accepts everything up front and leaves the verdict to the test, the
    /// way a browser device reports validation errors.
    #[derive(Default)]
    struct DeferredCompiler {
        verdicts: RefCell<Vec<Validation>>,
    }

    impl DeferredCompiler {
        fn latest(&self) -> Validation {
            self.verdicts.borrow().last().cloned().unwrap()
        }

        fn builds(&self) -> usize {
            self.verdicts.borrow().len()
        }
    }

    impl ShaderCompiler for DeferredCompiler {
        type Output = String;

        fn compile(&self, _name: &str, _layout: &BindingLayout, source: &ShaderSource) -> Result<Compiled<String>> {
            let validation = Validation::pending();
            self.verdicts.borrow_mut().push(validation.clone());
            Ok(Compiled {
                output: source.fragment.clone(),
                validation,
            })
        }
    }

    fn layout() -> BindingLayout {
        BindingLayout::for_model(std::iter::empty())
    }

    #[test]
    fn failed_reload_keeps_previous_build() {
        let loader = MemoryLoader::default();
        let compiler = FakeCompiler::default();
        let mut cache = ShaderCache::new();

        loader.set("phong", "fn fs_main() {}");
        let before = cache.get_or_create("phong", &layout(), &[], &loader, &compiler).unwrap();

        loader.set("phong", "fn fs_main() { syntax error }");
        assert_eq!(cache.reload("phong", &loader, &compiler), Some(ReloadOutcome::KeptPrevious));

        let after = cache.get("phong").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
        assert!(cache.last_error("phong").unwrap().contains("unexpected token"));
    }

    #[test]
    fn successful_reload_swaps_and_clears_error() {
        let loader = MemoryLoader::default();
        let compiler = FakeCompiler::default();
        let mut cache = ShaderCache::new();

        loader.set("phong", "v1");
        let before = cache.get_or_create("phong", &layout(), &[], &loader, &compiler).unwrap();
        loader.set("phong", "syntax error");
        cache.reload("phong", &loader, &compiler);
        loader.set("phong", "v2");

        assert_eq!(cache.reload("phong", &loader, &compiler), Some(ReloadOutcome::Reloaded));
        let after = cache.get("phong").unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.as_str(), "v2");
        assert!(cache.last_error("phong").is_none());
    }

    #[test]
    fn unchanged_source_is_not_recompiled() {
        let loader = MemoryLoader::default();
        let compiler = FakeCompiler::default();
        let mut cache = ShaderCache::new();

        loader.set("flat", "v1");
        cache.get_or_create("flat", &layout(), &[], &loader, &compiler).unwrap();
        assert_eq!(cache.reload("flat", &loader, &compiler), Some(ReloadOutcome::Unchanged));
        assert_eq!(compiler.builds.get(), 1);
        assert_eq!(cache.reload("missing", &loader, &compiler), None);
    }

    #[test]
    fn reload_all_reports_each_set() {
        let loader = MemoryLoader::default();
        let compiler = FakeCompiler::default();
        let mut cache = ShaderCache::new();

        for name in ["a", "b", "c"] {
            loader.set(name, "ok");
            cache.get_or_create(name, &layout(), &[], &loader, &compiler).unwrap();
        }
        loader.set("a", "ok again");
        loader.set("c", "syntax error");

        let summary = cache.reload_all(&loader, &compiler);
        assert_eq!(summary.reloaded, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.kept, vec!["c".to_string()]);
    }

    #[test]
    fn creation_failure_is_returned_and_not_cached() {
        let loader = MemoryLoader::default();
        let compiler = FakeCompiler::default();
        let mut cache = ShaderCache::<String>::new();

        loader.set("broken", "syntax error");
        let err = cache.get_or_create("broken", &layout(), &[], &loader, &compiler).unwrap_err();
        assert!(err.is_shader_compile());
        assert!(cache.get("broken").is_none());
    }

    #[test]
    fn same_set_with_other_slots_is_rejected() {
        let loader = MemoryLoader::default();
        let compiler = FakeCompiler::default();
        let mut cache = ShaderCache::new();
        loader.set("phong", "ok");

        cache.get_or_create("phong", &layout(), &[], &loader, &compiler).unwrap();
        let textured = BindingLayout::for_model(["DIFFUSE"]);
        let err = cache.get_or_create("phong", &textured, &[], &loader, &compiler).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn file_loader_requires_both_stages() {
        let mut loader = FileShaderLoader::new("/nonexistent/shader/root");
        loader.add_builtin("flat", "// UBO_VIEW_BINDING\n#include \"lights.wgsl\"", "fn fs_main() {}");

        let prelude = vec!["#define UBO_VIEW_BINDING 0".to_string(), "#define LIGHT_CAPACITY 4".to_string()];
        let source = loader.load("flat", &prelude).unwrap();
        assert!(source.vertex.contains("array<Light, 4>"));

        let err = loader.load("absent", &[]).unwrap_err();
        assert!(matches!(err, Error::MissingShaderStage { stage: "vertex", .. }));
    }

    #[test]
    fn late_validation_failure_leaves_active_build() {
        let loader = MemoryLoader::default();
        let compiler = DeferredCompiler::default();
        let mut cache = ShaderCache::new();

        loader.set("phong", "v1");
        let before = cache.get_or_create("phong", &layout(), &[], &loader, &compiler).unwrap();
        compiler.latest().settle(None);

        loader.set("phong", "v2 with a bad binding");
        assert_eq!(cache.reload("phong", &loader, &compiler), Some(ReloadOutcome::Validating));
        assert!(Arc::ptr_eq(&before, &cache.get("phong").unwrap()));

        // the staged build is not compiled a second time while it waits
        assert_eq!(cache.reload("phong", &loader, &compiler), Some(ReloadOutcome::Validating));
        assert_eq!(compiler.builds(), 2);
        assert_eq!(cache.settle_pending().validating, 1);

        compiler.latest().settle(Some("binding 3 is not declared".to_string()));
        let summary = cache.settle_pending();
        assert_eq!(summary.kept, vec!["phong".to_string()]);
        assert_eq!(summary.reloaded, 0);

        assert!(Arc::ptr_eq(&before, &cache.get("phong").unwrap()));
        assert_eq!(cache.last_error("phong"), Some("binding 3 is not declared"));
        assert_eq!(cache.settle_pending(), ReloadSummary::default());
    }

    #[test]
    fn late_validation_success_promotes_staged_build() {
        let loader = MemoryLoader::default();
        let compiler = DeferredCompiler::default();
        let mut cache = ShaderCache::new();

        loader.set("phong", "v1");
        cache.get_or_create("phong", &layout(), &[], &loader, &compiler).unwrap();
        loader.set("phong", "v2");
        cache.reload("phong", &loader, &compiler);
        assert_eq!(cache.get("phong").unwrap().as_str(), "v1");

        compiler.latest().settle(None);
        assert_eq!(cache.settle_pending().reloaded, 1);
        assert_eq!(cache.get("phong").unwrap().as_str(), "v2");
        assert_eq!(cache.reload("phong", &loader, &compiler), Some(ReloadOutcome::Unchanged));
    }

    #[test]
    fn creation_rejected_by_validation_is_not_cached() {
        struct Rejecting;
        impl ShaderCompiler for Rejecting {
            type Output = String;

            fn compile(&self, _name: &str, _layout: &BindingLayout, _source: &ShaderSource) -> Result<Compiled<String>> {
                let validation = Validation::pending();
                validation.settle(Some("no entry point".to_string()));
                Ok(Compiled {
                    output: String::new(),
                    validation,
                })
            }
        }

        let loader = MemoryLoader::default();
        let mut cache = ShaderCache::new();
        loader.set("flat", "ok");
        let err = cache.get_or_create("flat", &layout(), &[], &loader, &Rejecting).unwrap_err();
        assert!(err.is_shader_compile());
        assert!(cache.is_empty());
    }

    #[test]
    fn source_hash_separates_stages() {
        let a = ShaderSource { vertex: "ab".into(), fragment: "c".into() };
        let b = ShaderSource { vertex: "a".into(), fragment: "bc".into() };
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
