// src/draw.rs
//! Per-frame draw buckets.
//!
//! The forward drawer sorts visible submesh draws into one bucket per
//! pipeline family, then submits the buckets in a fixed order: opaque
//! geometry first, blended geometry last. Alpha-blended draws are sorted
//! back to front right before submission. Buckets are emptied by every
//! submit so records never leak into the next frame.

use glam::{Mat4, Vec4};

use crate::shader::PipelineKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKind {
    Opaque,
    Lines,
    Curves,
    NoCull,
    Additive,
    AlphaBlend,
}

impl BucketKind {
    pub const SUBMIT_ORDER: [BucketKind; 6] = [
        BucketKind::Opaque,
        BucketKind::Lines,
        BucketKind::Curves,
        BucketKind::NoCull,
        BucketKind::Additive,
        BucketKind::AlphaBlend,
    ];

    pub fn pipeline(self) -> PipelineKind {
        match self {
            BucketKind::Opaque => PipelineKind::Triangles,
            BucketKind::Lines => PipelineKind::Lines,
            BucketKind::Curves => PipelineKind::Curves,
            BucketKind::NoCull => PipelineKind::NoCull,
            BucketKind::Additive => PipelineKind::Additive,
            BucketKind::AlphaBlend => PipelineKind::AlphaBlend,
        }
    }

    pub fn uses_line_width(self) -> bool {
        matches!(self, BucketKind::Lines | BucketKind::Curves)
    }

    fn slot(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawRecord<T> {
    /// Index of the shader set in the frame's shader list.
    pub shader: usize,
    pub line_width: f32,
    /// Clip-space depth of the model origin; only alpha sorting reads it.
    pub depth: f32,
    pub item: T,
}

/// One family of draws. Each variant owns its records.
#[derive(Debug, Clone)]
pub enum DrawBucket<T> {
    Opaque(Vec<DrawRecord<T>>),
    Lines(Vec<DrawRecord<T>>),
    Curves(Vec<DrawRecord<T>>),
    NoCull(Vec<DrawRecord<T>>),
    Additive(Vec<DrawRecord<T>>),
    /// Sorted farthest first when submitted.
    AlphaBlend(Vec<DrawRecord<T>>),
}

impl<T> DrawBucket<T> {
    pub fn new(kind: BucketKind) -> Self {
        match kind {
            BucketKind::Opaque => DrawBucket::Opaque(Vec::new()),
            BucketKind::Lines => DrawBucket::Lines(Vec::new()),
            BucketKind::Curves => DrawBucket::Curves(Vec::new()),
            BucketKind::NoCull => DrawBucket::NoCull(Vec::new()),
            BucketKind::Additive => DrawBucket::Additive(Vec::new()),
            BucketKind::AlphaBlend => DrawBucket::AlphaBlend(Vec::new()),
        }
    }

    pub fn kind(&self) -> BucketKind {
        match self {
            DrawBucket::Opaque(_) => BucketKind::Opaque,
            DrawBucket::Lines(_) => BucketKind::Lines,
            DrawBucket::Curves(_) => BucketKind::Curves,
            DrawBucket::NoCull(_) => BucketKind::NoCull,
            DrawBucket::Additive(_) => BucketKind::Additive,
            DrawBucket::AlphaBlend(_) => BucketKind::AlphaBlend,
        }
    }

    pub fn records(&self) -> &[DrawRecord<T>] {
        match self {
            DrawBucket::Opaque(r)
            | DrawBucket::Lines(r)
            | DrawBucket::Curves(r)
            | DrawBucket::NoCull(r)
            | DrawBucket::Additive(r)
            | DrawBucket::AlphaBlend(r) => r,
        }
    }

    fn records_mut(&mut self) -> &mut Vec<DrawRecord<T>> {
        match self {
            DrawBucket::Opaque(r)
            | DrawBucket::Lines(r)
            | DrawBucket::Curves(r)
            | DrawBucket::NoCull(r)
            | DrawBucket::Additive(r)
            | DrawBucket::AlphaBlend(r) => r,
        }
    }

    /// Put records in submission order.
    fn order(&mut self) {
        if let DrawBucket::AlphaBlend(records) = self {
            records.sort_by(|a, b| b.depth.total_cmp(&a.depth));
        }
    }
}

/// Where submitted draws go. The renderer records into a render bundle;
/// tests record into a list.
pub trait DrawEncoder<T> {
    fn bind_pipeline(&mut self, shader: usize, kind: PipelineKind);

    /// Only called for line buckets, and only when the width changes.
    fn set_line_width(&mut self, width: f32);

    fn draw(&mut self, shader: usize, item: &T);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitStats {
    pub draws: usize,
    pub pipeline_binds: usize,
}

pub struct DrawBuckets<T> {
    buckets: [DrawBucket<T>; 6],
}

impl<T> Default for DrawBuckets<T> {
    fn default() -> Self {
        Self {
            buckets: BucketKind::SUBMIT_ORDER.map(DrawBucket::new),
        }
    }
}

impl<T> DrawBuckets<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: BucketKind, record: DrawRecord<T>) {
        self.buckets[kind.slot()].records_mut().push(record);
    }

    pub fn bucket(&self, kind: BucketKind) -> &DrawBucket<T> {
        &self.buckets[kind.slot()]
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.records().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.records().is_empty())
    }

    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.records_mut().clear();
        }
    }

    /// Submit every bucket in [`BucketKind::SUBMIT_ORDER`] and empty them.
    /// Pipelines are bound only when the (shader, kind) pair changes.
    pub fn submit(&mut self, encoder: &mut impl DrawEncoder<T>) -> SubmitStats {
        let mut stats = SubmitStats::default();
        let mut bound: Option<(usize, PipelineKind)> = None;
        let mut line_width: Option<f32> = None;

        for bucket in &mut self.buckets {
            bucket.order();
            let kind = bucket.kind();
            let pipeline = kind.pipeline();

            for record in bucket.records() {
                if bound != Some((record.shader, pipeline)) {
                    encoder.bind_pipeline(record.shader, pipeline);
                    bound = Some((record.shader, pipeline));
                    stats.pipeline_binds += 1;
                }
                if kind.uses_line_width() && line_width != Some(record.line_width) {
                    encoder.set_line_width(record.line_width);
                    line_width = Some(record.line_width);
                }
                encoder.draw(record.shader, &record.item);
                stats.draws += 1;
            }
            bucket.records_mut().clear();
        }
        stats
    }
}

/// Clip-space z of the model's origin, used to order blended draws.
pub fn clip_depth(view_projection: &Mat4, model: &Mat4) -> f32 {
    (*view_projection * *model * Vec4::W).z
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Call {
        Bind(usize, PipelineKind),
        Width(f32),
        Draw(&'static str),
    }

    #[derive(Default)]
    struct Recorder(Vec<Call>);

    impl DrawEncoder<&'static str> for Recorder {
        fn bind_pipeline(&mut self, shader: usize, kind: PipelineKind) {
            self.0.push(Call::Bind(shader, kind));
        }

        fn set_line_width(&mut self, width: f32) {
            self.0.push(Call::Width(width));
        }

        fn draw(&mut self, _shader: usize, item: &&'static str) {
            self.0.push(Call::Draw(item));
        }
    }

    impl Recorder {
        fn draws(&self) -> Vec<&'static str> {
            self.0
                .iter()
                .filter_map(|c| match c {
                    Call::Draw(name) => Some(*name),
                    _ => None,
                })
                .collect()
        }
    }

    fn record(item: &'static str, shader: usize, depth: f32) -> DrawRecord<&'static str> {
        DrawRecord {
            shader,
            line_width: 1.0,
            depth,
            item,
        }
    }

    #[test]
    fn alpha_bucket_draws_farthest_first() {
        let mut buckets = DrawBuckets::new();
        buckets.push(BucketKind::AlphaBlend, record("a", 0, 0.2));
        buckets.push(BucketKind::AlphaBlend, record("b", 0, 0.9));
        buckets.push(BucketKind::AlphaBlend, record("c", 0, 0.5));

        let mut rec = Recorder::default();
        buckets.submit(&mut rec);
        assert_eq!(rec.draws(), vec!["b", "c", "a"]);
    }

    #[test]
    fn buckets_submit_in_fixed_order() {
        let mut buckets = DrawBuckets::new();
        buckets.push(BucketKind::AlphaBlend, record("alpha", 0, 0.0));
        buckets.push(BucketKind::Additive, record("additive", 0, 0.0));
        buckets.push(BucketKind::NoCull, record("nocull", 0, 0.0));
        buckets.push(BucketKind::Curves, record("curves", 0, 0.0));
        buckets.push(BucketKind::Lines, record("lines", 0, 0.0));
        buckets.push(BucketKind::Opaque, record("opaque", 0, 0.0));

        let mut rec = Recorder::default();
        buckets.submit(&mut rec);
        assert_eq!(
            rec.draws(),
            vec!["opaque", "lines", "curves", "nocull", "additive", "alpha"]
        );
    }

    #[test]
    fn pipeline_rebinds_only_on_change() {
        let mut buckets = DrawBuckets::new();
        buckets.push(BucketKind::Opaque, record("a", 0, 0.0));
        buckets.push(BucketKind::Opaque, record("b", 0, 0.0));
        buckets.push(BucketKind::Opaque, record("c", 1, 0.0));
        buckets.push(BucketKind::NoCull, record("d", 1, 0.0));

        let mut rec = Recorder::default();
        let stats = buckets.submit(&mut rec);

        assert_eq!(stats.draws, 4);
        assert_eq!(stats.pipeline_binds, 3);
        assert_eq!(rec.0[0], Call::Bind(0, PipelineKind::Triangles));
        assert!(rec.0.contains(&Call::Bind(1, PipelineKind::NoCull)));
    }

    #[test]
    fn line_width_is_set_when_it_changes() {
        let mut buckets = DrawBuckets::new();
        for (item, width) in [("a", 1.0), ("b", 1.0), ("c", 3.0)] {
            buckets.push(
                BucketKind::Lines,
                DrawRecord {
                    shader: 0,
                    line_width: width,
                    depth: 0.0,
                    item,
                },
            );
        }
        buckets.push(BucketKind::Opaque, record("tri", 0, 0.0));

        let mut rec = Recorder::default();
        buckets.submit(&mut rec);
        let widths: Vec<_> = rec.0.iter().filter(|c| matches!(c, Call::Width(_))).collect();
        assert_eq!(widths, vec![&Call::Width(1.0), &Call::Width(3.0)]);
    }

    #[test]
    fn submit_leaves_buckets_empty() {
        let mut buckets = DrawBuckets::new();
        buckets.push(BucketKind::Opaque, record("a", 0, 0.0));
        buckets.push(BucketKind::AlphaBlend, record("b", 0, 0.0));
        assert_eq!(buckets.len(), 2);

        buckets.submit(&mut Recorder::default());
        assert!(buckets.is_empty());

        let mut rec = Recorder::default();
        buckets.submit(&mut rec);
        assert!(rec.0.is_empty());
    }

    #[test]
    fn clip_depth_grows_with_distance() {
        let proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0);
        let near = clip_depth(&proj, &Mat4::from_translation(glam::Vec3::new(0.0, 0.0, -2.0)));
        let far = clip_depth(&proj, &Mat4::from_translation(glam::Vec3::new(0.0, 0.0, -20.0)));
        assert!(far > near);
    }
}
