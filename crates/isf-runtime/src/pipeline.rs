//! Pipeline compiler: compiles per-pass programs and caches them.
//!
//! Two layers, as in a classic program cache: `PipelineKey` (document, pass, source hash)
//! maps to a `ProgramKey` (vertex hash, fragment hash), and program objects are shared by
//! every pipeline key with identical sources. A failed compile leaves both layers exactly as
//! they were before the call.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use isf_core::CompileError;
use isf_doc::DocumentId;
use isf_graph::RenderGraph;

use crate::backend::GpuBackend;
use crate::glsl::ShaderPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub document: DocumentId,
    pub pass_index: usize,
    pub source_hash: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ProgramKey {
    vert_hash: u64,
    frag_hash: u64,
}

#[derive(Debug)]
struct ProgramEntry<P> {
    program: P,
    /// Number of pipeline keys pointing at this program.
    refs: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub programs_compiled: u64,
}

/// One linked program per pass, in pass order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPipeline<P> {
    pub document: DocumentId,
    pub programs: Vec<P>,
}

impl<P: Copy> CompiledPipeline<P> {
    pub fn program(&self, pass: usize) -> Option<P> {
        self.programs.get(pass).copied()
    }
}

fn hash_str(s: &str) -> u64 {
    let mut h = DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

#[derive(Debug)]
pub struct PipelineCache<B: GpuBackend> {
    entries: HashMap<PipelineKey, ProgramKey>,
    programs: HashMap<ProgramKey, ProgramEntry<B::Program>>,
    stats: CacheStats,
}

impl<B: GpuBackend> Default for PipelineCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: GpuBackend> PipelineCache<B> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            programs: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of cached pipeline keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of live program objects.
    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    pub fn contains(&self, key: &PipelineKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Compile (or fetch) the program for every pass of `graph`.
    pub fn compile(
        &mut self,
        gpu: &mut B,
        graph: &RenderGraph,
        sources: &ShaderPair,
    ) -> Result<CompiledPipeline<B::Program>, CompileError> {
        let pkey = ProgramKey {
            vert_hash: hash_str(&sources.vertex),
            frag_hash: hash_str(&sources.fragment),
        };
        let source_hash = {
            let mut h = DefaultHasher::new();
            pkey.hash(&mut h);
            h.finish()
        };

        let mut added: Vec<PipelineKey> = Vec::new();
        let mut programs = Vec::with_capacity(graph.passes.len());

        for pass in &graph.passes {
            let key = PipelineKey {
                document: graph.document,
                pass_index: pass.index,
                source_hash,
            };

            if let Some(entry) = self.entries.get(&key).and_then(|k| self.programs.get(k)) {
                self.stats.hits += 1;
                tracing::debug!(document = %key.document, pass = pass.index, "pipeline cache hit");
                programs.push(entry.program);
                continue;
            }
            self.stats.misses += 1;

            if !self.programs.contains_key(&pkey) {
                match gpu.compile_program(&sources.vertex, &sources.fragment) {
                    Ok(program) => {
                        self.stats.programs_compiled += 1;
                        self.programs.insert(pkey, ProgramEntry { program, refs: 0 });
                    }
                    Err((stage, log)) => {
                        self.rollback(gpu, &added);
                        tracing::debug!(
                            document = %graph.document,
                            pass = pass.index,
                            %stage,
                            "pipeline compile failed"
                        );
                        return Err(CompileError {
                            pass_index: pass.index,
                            stage,
                            log,
                        });
                    }
                }
            }

            let Some(entry) = self.programs.get_mut(&pkey) else {
                continue;
            };
            entry.refs += 1;
            self.entries.insert(key, pkey);
            added.push(key);
            programs.push(entry.program);
            tracing::debug!(document = %key.document, pass = pass.index, "pipeline cache miss");
        }

        Ok(CompiledPipeline {
            document: graph.document,
            programs,
        })
    }

    fn rollback(&mut self, gpu: &mut B, added: &[PipelineKey]) {
        for key in added {
            self.unlink(gpu, key);
        }
    }

    fn unlink(&mut self, gpu: &mut B, key: &PipelineKey) {
        let Some(pkey) = self.entries.remove(key) else {
            return;
        };
        let unused = match self.programs.get_mut(&pkey) {
            Some(entry) => {
                entry.refs = entry.refs.saturating_sub(1);
                entry.refs == 0
            }
            None => false,
        };
        if unused {
            if let Some(entry) = self.programs.remove(&pkey) {
                gpu.delete_program(entry.program);
            }
        }
    }

    /// Drop every cached pipeline of `document`. Returns how many keys were removed.
    pub fn invalidate(&mut self, gpu: &mut B, document: DocumentId) -> usize {
        let keys: Vec<PipelineKey> = self
            .entries
            .keys()
            .filter(|k| k.document == document)
            .copied()
            .collect();
        for key in &keys {
            self.unlink(gpu, key);
        }
        if !keys.is_empty() {
            tracing::debug!(%document, removed = keys.len(), "invalidated pipelines");
        }
        keys.len()
    }

    /// Release every program.
    pub fn clear(&mut self, gpu: &mut B) {
        for (_, entry) in self.programs.drain() {
            gpu.delete_program(entry.program);
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glsl::assemble;
    use crate::headless::HeadlessBackend;
    use isf_core::ShaderStage;
    use isf_doc::parse;

    const TWO_PASS: &str = r#"/*{ "PASSES": [ { "TARGET": "a" }, {} ] }*/
void main() { gl_FragColor = vec4(1.0, 0.0, 0.0, 1.0); }
"#;

    fn setup(text: &str) -> (RenderGraph, ShaderPair) {
        let doc = parse(text).unwrap();
        let graph = isf_graph::build(&doc).unwrap();
        let pair = assemble(&doc, "330 core");
        (graph, pair)
    }

    #[test]
    fn passes_share_one_program_and_second_compile_hits() {
        let mut gpu = HeadlessBackend::new();
        let mut cache = PipelineCache::<HeadlessBackend>::new();
        let (graph, pair) = setup(TWO_PASS);

        let first = cache.compile(&mut gpu, &graph, &pair).unwrap();
        assert_eq!(first.programs.len(), 2);
        assert_eq!(first.programs[0], first.programs[1]);
        assert_eq!(gpu.compile_count(), 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.program_count(), 1);

        let second = cache.compile(&mut gpu, &graph, &pair).unwrap();
        assert_eq!(first, second);
        assert_eq!(gpu.compile_count(), 1);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn failed_compile_registers_nothing() {
        let mut gpu = HeadlessBackend::new();
        let mut cache = PipelineCache::<HeadlessBackend>::new();
        let (graph, pair) = setup(
            "/*{}*/\nvoid main() {\n#error broken on purpose\n}\n",
        );

        let err = cache.compile(&mut gpu, &graph, &pair).unwrap_err();
        assert_eq!(err.pass_index, 0);
        assert_eq!(err.stage, ShaderStage::Fragment);
        assert!(err.log.contains("broken on purpose"), "{}", err.log);
        assert!(cache.is_empty());
        assert_eq!(cache.program_count(), 0);
    }

    #[test]
    fn invalidate_releases_programs() {
        let mut gpu = HeadlessBackend::new();
        let mut cache = PipelineCache::<HeadlessBackend>::new();
        let (graph, pair) = setup(TWO_PASS);
        cache.compile(&mut gpu, &graph, &pair).unwrap();

        assert_eq!(cache.invalidate(&mut gpu, graph.document), 2);
        assert!(cache.is_empty());
        assert_eq!(gpu.live_programs(), 0);

        cache.compile(&mut gpu, &graph, &pair).unwrap();
        assert_eq!(gpu.compile_count(), 2);
        cache.clear(&mut gpu);
        assert_eq!(gpu.live_programs(), 0);
    }
}
