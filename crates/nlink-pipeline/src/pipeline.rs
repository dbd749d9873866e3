//! Component H — the pipeline engine proper: loads and wires a manifest's
//! components, then drives either a single linear pass or the iterated
//! execution groups a cyclic manifest requires.

use crate::manifest::{ConnectionDirection, PipelineManifest};
use nlink_context::Context;
use nlink_depgraph::{EdgeDirection, ExecutionGroup, GraphBuilder, ReentrantGraph};
use nlink_loader::{global_handle_registry, Address, ComponentLoader, HandleRegistry, ImageLoader, RawHandle};
use nlink_result::{NexusError, Result};
use nlink_stream::DataStream;
use nlink_version::Constraint;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Metadata key a cyclic group's member writes to its own output stream
/// to ask the engine to stop iterating after the current pass, rather
/// than waiting on `max_iteration_count` or a dirty-free pass.
pub const HALT_METADATA_KEY: &str = "halt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Unloaded,
    Initialized,
}

#[derive(Debug, Clone)]
pub struct ComponentRuntime {
    pub id: String,
    pub optional: bool,
    pub supports_reentrance: bool,
    pub version_constraint: Option<Constraint>,
    pub state: LifecycleState,
    pub last_elapsed_ms: u64,
    path: String,
    handle: Option<RawHandle>,
    process_address: Option<Address>,
}

#[derive(Debug, Clone)]
enum ExecutionPlan {
    SinglePass(Vec<String>),
    MultiPass(Vec<ExecutionGroup>),
}

#[derive(Debug, Clone, Default)]
pub struct PipelineStatistics {
    pub total_iterations: u64,
    pub total_component_executions: u64,
    pub total_execution_time_ms: u64,
    pub max_group_size: usize,
}

impl PipelineStatistics {
    pub fn avg_iteration_time_ms(&self) -> f64 {
        if self.total_iterations == 0 {
            0.0
        } else {
            self.total_execution_time_ms as f64 / self.total_iterations as f64
        }
    }
}

/// Error-handler callback invoked whenever a component's process
/// function, or the engine driving it, fails: the error itself, the
/// component id it happened in (`None` for pipeline-level failures), and
/// a human-readable message.
pub type ErrorHandler = Arc<dyn Fn(&NexusError, Option<&str>, &str) + Send + Sync>;

fn default_error_handler(error: &NexusError, component_id: Option<&str>, message: &str) {
    match component_id {
        Some(id) => warn!(component = id, error = %error, "{message}"),
        None => warn!(error = %error, "{message}"),
    }
}

pub fn component_image_path(id: &str) -> String {
    format!("components/{id}/lib{id}.{}", std::env::consts::DLL_EXTENSION)
}

/// The pipeline engine. `L` is the platform-specific image loader; test
/// code and embedders alike supply their own.
pub struct Pipeline<L: ImageLoader> {
    pub id: String,
    manifest: PipelineManifest,
    context: Context,
    loader: ComponentLoader<L>,
    components: HashMap<String, ComponentRuntime>,
    plan: ExecutionPlan,
    initialized: bool,
    aborted: bool,
    error_handler: ErrorHandler,
    pub statistics: PipelineStatistics,
}

impl<L: ImageLoader> Pipeline<L> {
    /// Builds the dependency graph appropriate to the manifest's mode and
    /// validates it, but loads no images yet — that's `initialize`'s job.
    /// Shares the process-wide `HandleRegistry`, so a component an earlier
    /// `Pipeline` loaded stays loaded when this one looks up the same path.
    pub fn create(manifest: PipelineManifest, loader: L, context: Context) -> Result<Self> {
        Self::create_with_handles(manifest, loader, context, global_handle_registry())
    }

    /// Same as [`Self::create`], but wires in an explicit `HandleRegistry`
    /// instead of the process-wide one — the seam tests use so that two
    /// tests loading the same component path don't see each other's
    /// handles.
    fn create_with_handles(
        manifest: PipelineManifest,
        loader: L,
        context: Context,
        handles: &'static HandleRegistry,
    ) -> Result<Self> {
        manifest.validate()?;

        let ids: Vec<String> = manifest
            .components
            .iter()
            .map(|c| c.component_id.clone())
            .collect();

        let plan = if manifest.is_multi_pass() {
            let mut graph = ReentrantGraph::new();
            for component in &manifest.components {
                graph.add_node(component.component_id.clone(), component.supports_reentrance);
            }
            for conn in &manifest.connections {
                let direction = match conn.direction {
                    ConnectionDirection::Forward => EdgeDirection::Forward,
                    ConnectionDirection::Backward => EdgeDirection::Backward,
                    ConnectionDirection::Bidirectional => EdgeDirection::Bidirectional,
                };
                graph.add_edge(conn.src.clone(), conn.dst.clone(), direction, conn.format.clone());
            }
            ExecutionPlan::MultiPass(graph.execution_groups()?)
        } else {
            let declares_edges = manifest.components.iter().any(|c| !c.depends_on.is_empty());
            let graph = if declares_edges {
                let edges: Vec<(String, String, Option<String>, bool)> = manifest
                    .components
                    .iter()
                    .flat_map(|c| {
                        let consumer = c.component_id.clone();
                        c.depends_on.iter().map(move |dep| (consumer.clone(), dep.clone(), None, false))
                    })
                    .collect();
                GraphBuilder::from_declared_edges(&ids, &edges)
            } else {
                GraphBuilder::positional(&ids)
            };
            graph.validate_dependencies_present()?;
            ExecutionPlan::SinglePass(graph.topological_sort()?)
        };

        let mut components = HashMap::with_capacity(manifest.components.len());
        for component in &manifest.components {
            let version_constraint = match &component.version {
                Some(v) => Some(Constraint::parse(v)?),
                None => None,
            };
            components.insert(
                component.component_id.clone(),
                ComponentRuntime {
                    id: component.component_id.clone(),
                    optional: component.optional,
                    supports_reentrance: component.supports_reentrance,
                    version_constraint,
                    state: LifecycleState::Unloaded,
                    last_elapsed_ms: 0,
                    path: component_image_path(&component.component_id),
                    handle: None,
                    process_address: None,
                },
            );
        }

        Ok(Self {
            id: manifest.pipeline_id.clone(),
            manifest,
            context,
            loader: ComponentLoader::with_registry(loader, handles),
            components,
            plan,
            initialized: false,
            aborted: false,
            error_handler: Arc::new(default_error_handler),
            statistics: PipelineStatistics::default(),
        })
    }

    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = handler;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn component_state(&self, id: &str) -> Option<LifecycleState> {
        self.components.get(id).map(|c| c.state)
    }

    /// Flattened load order: the single-pass topological order as-is, or
    /// every multi-pass group's members flattened and re-sorted to the
    /// manifest's declared component order (execution-group membership
    /// doesn't matter for load order, only for later execution).
    fn initialization_order(&self) -> Vec<String> {
        match &self.plan {
            ExecutionPlan::SinglePass(order) => order.clone(),
            ExecutionPlan::MultiPass(groups) => {
                let mut flat: Vec<String> = groups.iter().flat_map(|g| g.members.clone()).collect();
                flat.sort_by_key(|id| self.manifest_index(id));
                flat
            }
        }
    }

    fn manifest_index(&self, id: &str) -> usize {
        self.manifest
            .components
            .iter()
            .position(|c| c.component_id == id)
            .unwrap_or(usize::MAX)
    }

    /// Loads and resolves every component's process entry point in
    /// dependency order. An optional component's failure is logged and
    /// skipped; a required component's failure unwinds everything loaded
    /// so far and returns the error.
    pub fn initialize(&mut self) -> Result<()> {
        let order = self.initialization_order();
        let mut loaded_so_far = Vec::new();

        for id in &order {
            match self.load_and_resolve_one(id) {
                Ok(()) => loaded_so_far.push(id.clone()),
                Err(e) => {
                    let optional = self.components.get(id).map(|c| c.optional).unwrap_or(false);
                    if optional {
                        warn!(component = id.as_str(), error = %e, "optional component failed to initialize, skipping");
                        continue;
                    }
                    warn!(component = id.as_str(), error = %e, "required component failed to initialize, aborting");
                    self.unload_all(&loaded_so_far);
                    return Err(e);
                }
            }
        }

        self.initialized = true;
        self.aborted = false;
        info!(pipeline = self.id.as_str(), components = order.len(), "pipeline initialized");
        Ok(())
    }

    fn load_and_resolve_one(&mut self, id: &str) -> Result<()> {
        let path = self
            .components
            .get(id)
            .ok_or_else(|| NexusError::NotFound { name: id.to_string() })?
            .path
            .clone();
        let record = self.loader.load(&self.context, &path, id)?;
        let symbol = format!("{id}_process");
        let address = self
            .loader
            .resolve_symbol(&path, &symbol)
            .ok_or_else(|| NexusError::SymbolNotFound(symbol))?;
        let component = self.components.get_mut(id).ok_or_else(|| NexusError::NotFound { name: id.to_string() })?;
        component.handle = Some(record.handle);
        component.process_address = Some(address);
        component.state = LifecycleState::Initialized;
        Ok(())
    }

    fn unload_all(&mut self, ids: &[String]) {
        for id in ids.iter().rev() {
            let path = match self.components.get(id) {
                Some(c) => c.path.clone(),
                None => continue,
            };
            let _ = self.loader.unload(&self.context, &path, id);
            if let Some(component) = self.components.get_mut(id) {
                component.state = LifecycleState::Unloaded;
                component.handle = None;
                component.process_address = None;
            }
        }
    }

    fn run_component(&mut self, id: &str, input: &mut DataStream, output: &mut DataStream) -> Result<()> {
        let (path, address) = {
            let component = self.components.get(id).ok_or_else(|| NexusError::NotFound { name: id.to_string() })?;
            let address = component
                .process_address
                .ok_or_else(|| NexusError::SymbolNotFound(format!("{id}_process")))?;
            (component.path.clone(), address)
        };
        let start = Instant::now();
        let outcome = self.loader.invoke_process(&path, address, input, output);
        let elapsed_ms = start.elapsed().as_millis() as u64;
        if let Some(component) = self.components.get_mut(id) {
            component.last_elapsed_ms = elapsed_ms;
        }
        self.statistics.total_execution_time_ms += elapsed_ms;
        self.statistics.total_component_executions += 1;

        match outcome {
            Ok(code)
                if code == nlink_result::CODE_SUCCESS || code == nlink_result::CODE_PARTIAL_SUCCESS =>
            {
                Ok(())
            }
            Ok(code) => Err(NexusError::ComponentProcessFailed {
                id: id.to_string(),
                reason: format!("result code {code}"),
            }),
            Err(e) => Err(NexusError::ComponentProcessFailed {
                id: id.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    /// Runs every initialized component once, in topological order,
    /// threading a freshly allocated intermediate stream between each
    /// pair. Only valid when the manifest built a single-pass plan.
    pub fn execute_single_pass(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        if !self.initialized {
            return Err(NexusError::NotInitialized);
        }
        if self.aborted {
            return Err(NexusError::PipelineAborted);
        }
        let order = match &self.plan {
            ExecutionPlan::SinglePass(order) => order.clone(),
            ExecutionPlan::MultiPass(_) => {
                return Err(NexusError::Unsupported(
                    "execute_single_pass called on a multi-pass pipeline".to_string(),
                ))
            }
        };
        let active: Vec<String> = order
            .into_iter()
            .filter(|id| self.components[id].state == LifecycleState::Initialized)
            .collect();

        let mut current = DataStream::new(self.manifest.input_format.clone());
        current.write(input)?;
        current.reset();

        for (i, id) in active.iter().enumerate() {
            let format = if i + 1 == active.len() {
                self.manifest.output_format.clone()
            } else {
                "binary".to_string()
            };
            let mut output_stream = DataStream::new(format);
            if let Err(e) = self.run_component(id, &mut current, &mut output_stream) {
                (self.error_handler)(&e, Some(id.as_str()), &e.to_string());
                if !self.manifest.allow_partial_processing {
                    return Err(e);
                }
            }
            output_stream.reset();
            current = output_stream;
        }

        let mut out = vec![0u8; current.size()];
        current.read(&mut out);
        Ok(out)
    }

    /// Runs every execution group in topological order: forward-only
    /// groups once, cyclic groups iterated to quiescence or
    /// `max_iteration_count`. Only valid when the manifest built a
    /// multi-pass plan.
    ///
    /// Each member in a cyclic group is assumed to have at most one
    /// incoming and one outgoing edge inside that group — the shape every
    /// declared cyclic manifest in this workspace uses. A component with
    /// more edges than that inside its own cycle isn't disambiguated here.
    pub fn execute_multi_pass(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        if !self.initialized {
            return Err(NexusError::NotInitialized);
        }
        if self.aborted {
            return Err(NexusError::PipelineAborted);
        }
        let groups = match &self.plan {
            ExecutionPlan::MultiPass(groups) => groups.clone(),
            ExecutionPlan::SinglePass(_) => {
                return Err(NexusError::Unsupported(
                    "execute_multi_pass called on a single-pass pipeline".to_string(),
                ))
            }
        };

        let mut edges: HashMap<(String, String), DataStream> = self
            .manifest
            .connections
            .iter()
            .map(|c| ((c.src.clone(), c.dst.clone()), DataStream::new(c.format.clone())))
            .collect();

        if let Some(entry) = self.entry_edge(&groups) {
            if let Some(stream) = edges.get_mut(&entry) {
                stream.write(input)?;
                stream.reset();
            }
        }

        for group in &groups {
            if group.has_cycles {
                self.run_cyclic_group(group, &mut edges)?;
            } else {
                self.run_forward_group(group, &mut edges)?;
            }
        }

        let out = self
            .exit_edge(&groups)
            .and_then(|key| edges.get_mut(&key))
            .map(|stream| {
                stream.reset();
                let mut bytes = vec![0u8; stream.size()];
                stream.read(&mut bytes);
                bytes
            })
            .unwrap_or_default();
        Ok(out)
    }

    /// `group.members` in manifest declaration order, not Tarjan's
    /// discovery order — the only order `max_iteration_count` and the
    /// insertion-order execution guarantee actually mean anything for.
    fn ordered_members(&self, group: &ExecutionGroup) -> Vec<String> {
        let mut members = group.members.clone();
        members.sort_by_key(|id| self.manifest_index(id));
        members
    }

    /// The edge carrying the external call's input: whichever declared
    /// connection targets the first member (declaration order) of the
    /// first execution group.
    fn entry_edge(&self, groups: &[ExecutionGroup]) -> Option<(String, String)> {
        let first = self.ordered_members(groups.first()?).into_iter().next()?;
        self.manifest
            .connections
            .iter()
            .find(|c| c.dst == first)
            .map(|c| (c.src.clone(), c.dst.clone()))
    }

    /// The edge carrying the final result: whichever declared connection
    /// originates from the last member (declaration order) of the last
    /// execution group.
    fn exit_edge(&self, groups: &[ExecutionGroup]) -> Option<(String, String)> {
        let last = self.ordered_members(groups.last()?).into_iter().next_back()?;
        self.manifest
            .connections
            .iter()
            .find(|c| c.src == last)
            .map(|c| (c.src.clone(), c.dst.clone()))
    }

    fn member_input_key(&self, group: &ExecutionGroup, member: &str) -> Option<(String, String)> {
        self.manifest
            .connections
            .iter()
            .find(|c| c.dst == member && group.members.contains(&c.src))
            .map(|c| (c.src.clone(), c.dst.clone()))
    }

    fn member_output_key(&self, group: &ExecutionGroup, member: &str) -> Option<(String, String)> {
        self.manifest
            .connections
            .iter()
            .find(|c| c.src == member && group.members.contains(&c.dst))
            .map(|c| (c.src.clone(), c.dst.clone()))
    }

    fn run_forward_group(
        &mut self,
        group: &ExecutionGroup,
        edges: &mut HashMap<(String, String), DataStream>,
    ) -> Result<()> {
        for member in &self.ordered_members(group) {
            if self.components.get(member).map(|c| c.state) != Some(LifecycleState::Initialized) {
                continue;
            }
            let input_key = self
                .manifest
                .connections
                .iter()
                .find(|c| c.dst == *member)
                .map(|c| (c.src.clone(), c.dst.clone()));
            let output_key = self
                .manifest
                .connections
                .iter()
                .find(|c| c.src == *member)
                .map(|c| (c.src.clone(), c.dst.clone()));

            let mut input_stream = input_key
                .as_ref()
                .and_then(|k| edges.remove(k))
                .unwrap_or_else(|| DataStream::new(self.manifest.input_format.clone()));
            input_stream.reset();
            let mut output_stream = output_key
                .as_ref()
                .and_then(|k| edges.remove(k))
                .unwrap_or_else(|| DataStream::new(self.manifest.output_format.clone()));

            let run_result = self.run_component(member, &mut input_stream, &mut output_stream);

            if let Some(k) = input_key {
                edges.insert(k, input_stream);
            }
            if let Some(k) = output_key {
                edges.insert(k, output_stream);
            }

            if let Err(e) = run_result {
                (self.error_handler)(&e, Some(member.as_str()), &e.to_string());
                if !self.manifest.allow_partial_processing {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Iterates `group`'s members, in declared order, once per pass, until
    /// either a member signals [`HALT_METADATA_KEY`] on its own output, no
    /// member's output stream was written to during a pass, or
    /// `max_iteration_count` passes have run.
    fn run_cyclic_group(
        &mut self,
        group: &ExecutionGroup,
        edges: &mut HashMap<(String, String), DataStream>,
    ) -> Result<()> {
        self.statistics.max_group_size = self.statistics.max_group_size.max(group.members.len());
        let members = self.ordered_members(group);

        let mut iterations = 0u32;
        loop {
            if iterations >= self.manifest.max_iteration_count {
                warn!(group = ?members, iterations, "cyclic execution group hit the iteration cap");
                return Err(NexusError::MaxIterationsExceeded(self.manifest.max_iteration_count));
            }

            let mut any_written = false;
            let mut halt_requested = false;

            for member in &members {
                if self.components.get(member).map(|c| c.state) != Some(LifecycleState::Initialized) {
                    continue;
                }
                let input_key = self.member_input_key(group, member);
                let output_key = self.member_output_key(group, member);

                let mut input_stream = input_key
                    .as_ref()
                    .and_then(|k| edges.remove(k))
                    .unwrap_or_else(|| DataStream::new("binary"));
                input_stream.reset();
                let mut output_stream = output_key
                    .as_ref()
                    .and_then(|k| edges.remove(k))
                    .unwrap_or_else(|| DataStream::new("binary"));
                // Each pass starts its members' outputs fresh; a cyclic
                // edge carries this pass's message, not an accumulation
                // of every prior pass's writes.
                output_stream.clear();

                let run_result = self.run_component(member, &mut input_stream, &mut output_stream);

                if output_stream.size() > 0 {
                    any_written = true;
                }
                if output_stream
                    .metadata
                    .get(HALT_METADATA_KEY)
                    .and_then(|v| v.downcast_ref::<bool>())
                    .copied()
                    .unwrap_or(false)
                {
                    halt_requested = true;
                }

                if let Some(k) = input_key {
                    edges.insert(k, input_stream);
                }
                if let Some(k) = output_key {
                    edges.insert(k, output_stream);
                }

                if let Err(e) = run_result {
                    (self.error_handler)(&e, Some(member.as_str()), &e.to_string());
                    if !self.manifest.allow_partial_processing {
                        return Err(e);
                    }
                }
            }

            iterations += 1;
            self.statistics.total_iterations += 1;

            if halt_requested || !any_written {
                break;
            }
        }
        Ok(())
    }

    /// Dispatches to whichever of `execute_single_pass` /
    /// `execute_multi_pass` matches the manifest's mode.
    pub fn execute(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        match &self.plan {
            ExecutionPlan::SinglePass(_) => self.execute_single_pass(input),
            ExecutionPlan::MultiPass(_) => self.execute_multi_pass(input),
        }
    }

    /// Unloads every component and marks the pipeline uninitialized.
    /// `initialize` must run again before the next `execute`.
    pub fn terminate(&mut self) -> Result<()> {
        let ids: Vec<String> = self.components.keys().cloned().collect();
        self.unload_all(&ids);
        self.initialized = false;
        info!(pipeline = self.id.as_str(), "pipeline terminated");
        Ok(())
    }

    /// Unloads every component via the abort hook rather than the
    /// ordinary cleanup hook, and marks the pipeline aborted: further
    /// `execute` calls fail with `PipelineAborted` until `initialize`
    /// runs again.
    pub fn abort(&mut self) -> Result<()> {
        let ids: Vec<String> = self.components.keys().cloned().collect();
        for id in ids.iter().rev() {
            let path = match self.components.get(id) {
                Some(c) => c.path.clone(),
                None => continue,
            };
            let _ = self.loader.unload_via_abort(&self.context, &path, id);
            if let Some(component) = self.components.get_mut(id) {
                component.state = LifecycleState::Unloaded;
                component.handle = None;
                component.process_address = None;
            }
        }
        self.initialized = false;
        self.aborted = true;
        warn!(pipeline = self.id.as_str(), "pipeline aborted");
        Ok(())
    }
}
