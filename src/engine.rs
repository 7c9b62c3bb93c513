//! Device executor: Random Ball Cover build and queries on wgpu.
//!
//! The heavy passes run as compute shaders:
//!
//! - `compute_distances` fills representative-by-point and
//!   query-by-representative distance blocks,
//! - `assign_owners` picks every point's nearest representative straight
//!   from the device-resident block,
//! - `find_ranges` bisects each query's radius over the weighted
//!   representative distances,
//! - `plan_knn` scores the work items of a [`ComputePlan`].
//!
//! Sampling, partitioning, candidate selection, plan building and the final
//! per-query reduction stay on the host and are shared with [`crate::cpu`].

use crate::{
    device::GpuContext,
    error::{RbcError, Result},
    index::{select_representatives, validate_build, validate_representatives, RbcIndex},
    plan::ComputePlan,
    query::{
        candidate_target, finalize, report_clipped_radii, report_coverage_gaps, select_exact, select_in_range, validate_query,
        QueryBatch, QueryPhase, SearchMode,
    },
    range::RangeResult,
    select::TopKArena,
    shaders::{CompiledShaders, ShaderSources, ASSIGN_ENTRY, DISTANCE_ENTRY, PLAN_KNN_ENTRY, RANGE_ENTRY},
    types::{
        AssignParams, DistanceParams, KnnResult, NnResult, PlanParams, PointMatrix, QueryStats, RangeParams,
        RbcConfig, WorkItem,
    },
};
use bytemuck::{cast_slice, Pod};
use log::{debug, info};
use std::time::Instant;
use wgpu::util::DeviceExt;

/// Workgroups per dispatch dimension guaranteed by every backend.
const MAX_DISPATCH: u32 = 65_535;
/// Tile edge of `distance.wgsl`.
const DISTANCE_TILE: u32 = 16;

/// Main RBC compute engine.
pub struct RbcCompute {
    /// GPU context
    context: GpuContext,
    /// Configuration
    config: RbcConfig,
    /// Compute pipelines
    pipelines: ComputePipelines,
}

/// All compute pipelines used by the engine.
struct ComputePipelines {
    distance: wgpu::ComputePipeline,
    range: wgpu::ComputePipeline,
    assign: wgpu::ComputePipeline,
    plan_knn: wgpu::ComputePipeline,
}

/// Device-side distance block, `rows x cols`, row-major.
struct DistanceBlock {
    buffer: wgpu::Buffer,
    rows: u32,
    cols: u32,
}

/// Index buffers resident on the device, created by [`RbcCompute::upload_index`].
///
/// Holds the representatives, the reordered database and the owned sizes
/// used as range weights. Query distance blocks are still read back per
/// batch for host-side candidate selection.
pub struct DeviceIndex {
    representatives: wgpu::Buffer,
    database: wgpu::Buffer,
    weights: wgpu::Buffer,
    points: usize,
    reps: usize,
    dim: usize,
}

impl DeviceIndex {
    /// Number of uploaded database points.
    pub fn len(&self) -> usize {
        self.points
    }

    /// True when no points were uploaded.
    pub fn is_empty(&self) -> bool {
        self.points == 0
    }

    /// Number of uploaded representatives.
    pub fn num_representatives(&self) -> usize {
        self.reps
    }

    fn matches(&self, index: &RbcIndex) -> bool {
        self.points == index.len() && self.reps == index.num_representatives() && self.dim == index.dim()
    }
}

/// Scored but not yet reduced query block.
struct ScoredBlock {
    arena: TopKArena,
    plan: ComputePlan,
}

impl RbcCompute {
    /// Creates a new engine with the given context and configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or incompatible with the device.
    pub fn new(context: GpuContext, config: RbcConfig) -> Result<Self> {
        context.supports_config(&config)?;

        let shader_sources = ShaderSources::default();
        let shaders = CompiledShaders::compile(&context.device, &shader_sources)?;
        let pipelines = create_pipelines(&context.device, &shaders);

        Ok(Self {
            context,
            config,
            pipelines,
        })
    }

    /// Creates a new engine with optimal configuration for the device.
    pub fn with_optimal_config(context: GpuContext) -> Result<Self> {
        let config = context.create_optimal_config();
        Self::new(context, config)
    }

    /// Active configuration.
    pub fn config(&self) -> &RbcConfig {
        &self.config
    }

    /// Execution context the engine runs on.
    pub fn context(&self) -> &GpuContext {
        &self.context
    }

    /// Builds an index with `rep_count` representatives sampled with `seed`.
    ///
    /// # Errors
    /// Structural errors as for the host build; `NotSupported` if the
    /// database exceeds the configured or device limits.
    pub async fn build_index(&self, database: &PointMatrix, rep_count: usize, seed: u64) -> Result<RbcIndex> {
        validate_build(database, rep_count)?;
        let rep_ids = select_representatives(database.rows(), rep_count, seed);
        self.build_from_ids(database, rep_ids).await
    }

    /// Builds an index using the given database rows as representatives.
    pub async fn build_index_from_representatives(
        &self,
        database: &PointMatrix,
        rep_ids: &[usize],
    ) -> Result<RbcIndex> {
        validate_representatives(database, rep_ids)?;
        self.build_from_ids(database, rep_ids.to_vec()).await
    }

    async fn build_from_ids(&self, database: &PointMatrix, rep_ids: Vec<usize>) -> Result<RbcIndex> {
        let start = Instant::now();
        self.check_points(database.rows())?;
        let n = database.rows() as u32;
        let reps = database.gather(&rep_ids);

        let reps_buf = self.storage_init("Representatives Buffer", reps.as_slice())?;
        let db_buf = self.storage_init("Database Buffer", database.as_slice())?;
        let owners_buf = self.storage_output("Owners Buffer", n as u64)?;
        let owner_dists_buf = self.storage_output("Owner Distances Buffer", n as u64)?;

        // Column passes keep each reps x cols block inside one binding
        let cols_per_pass = self.columns_per_pass(reps.rows() as u32)?;
        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("RBC Build Encoder"),
            });
        let mut offset = 0u32;
        while offset < n {
            let cols = cols_per_pass.min(n - offset);
            let block = self.encode_distances(&mut encoder, &reps_buf, &db_buf, reps.rows() as u32, cols, offset, reps.dim() as u32)?;
            self.encode_assign(&mut encoder, &block, &owners_buf, &owner_dists_buf, offset)?;
            offset += cols;
        }
        self.context.queue.submit(Some(encoder.finish()));
        debug!(
            "Build distance/assign passes submitted ({} columns per pass)",
            cols_per_pass
        );

        let owners: Vec<u32> = self.read_buffer(&owners_buf, n as usize).await?;
        let owner_dists: Vec<f32> = self.read_buffer(&owner_dists_buf, n as usize).await?;
        let index = RbcIndex::assemble(database, rep_ids, owners, owner_dists, &self.config)?;

        info!(
            "Built index over {} points with {} representatives in {:.2} ms",
            index.len(),
            index.num_representatives(),
            start.elapsed().as_secs_f32() * 1000.0
        );
        Ok(index)
    }

    /// Approximate kNN with a per-query candidate budget.
    pub async fn query(
        &self,
        index: &RbcIndex,
        queries: &PointMatrix,
        k: usize,
        candidate_budget: usize,
    ) -> Result<KnnResult> {
        self.run_query(index, queries, k, SearchMode::Budgeted(candidate_budget)).await
    }

    /// Exact kNN using triangle-inequality pruning.
    pub async fn query_exact(&self, index: &RbcIndex, queries: &PointMatrix, k: usize) -> Result<KnnResult> {
        self.run_query(index, queries, k, SearchMode::Exact).await
    }

    /// Single nearest neighbor per query.
    pub async fn query_nn(&self, index: &RbcIndex, queries: &PointMatrix, candidate_budget: usize) -> Result<NnResult> {
        self.run_query(index, queries, 1, SearchMode::Budgeted(candidate_budget))
            .await
            .map(NnResult::from)
    }

    /// Uploads the index's representatives, reordered database and owned
    /// sizes once so several query batches can reuse them.
    ///
    /// # Errors
    /// `NotSupported` if the index exceeds the configured or device limits.
    pub fn upload_index(&self, index: &RbcIndex) -> Result<DeviceIndex> {
        self.check_points(index.len())?;
        let device_index = DeviceIndex {
            representatives: self.storage_init("Representatives Buffer", index.representatives().as_slice())?,
            database: self.storage_init("Reordered Database Buffer", index.reordered_database().as_slice())?,
            weights: self.storage_init("Owned Sizes Buffer", &index.owned_sizes())?,
            points: index.len(),
            reps: index.num_representatives(),
            dim: index.dim(),
        };
        debug!(
            "Uploaded index: {} points, {} representatives",
            device_index.points, device_index.reps
        );
        Ok(device_index)
    }

    /// Runs a query batch in the given search mode.
    ///
    /// Uploads the index for this batch only; use [`Self::upload_index`] and
    /// [`Self::run_query_resident`] to keep it on the device between batches.
    pub async fn run_query(
        &self,
        index: &RbcIndex,
        queries: &PointMatrix,
        k: usize,
        mode: SearchMode,
    ) -> Result<KnnResult> {
        self.check_query(index, queries, k)?;
        let device_index = self.upload_index(index)?;
        self.run_query_resident(index, &device_index, queries, k, mode).await
    }

    /// Runs a query batch against buffers from [`Self::upload_index`].
    ///
    /// Large batches are split into blocks whose query-by-representative
    /// distances fit a single binding; every block is scored before any
    /// is reduced.
    ///
    /// # Errors
    /// `ShapeMismatch` if `device_index` was uploaded from a different index.
    pub async fn run_query_resident(
        &self,
        index: &RbcIndex,
        device_index: &DeviceIndex,
        queries: &PointMatrix,
        k: usize,
        mode: SearchMode,
    ) -> Result<KnnResult> {
        self.check_query(index, queries, k)?;
        if !device_index.matches(index) {
            return Err(RbcError::shape(
                format!(
                    "device index of {} points and {} representatives",
                    index.len(),
                    index.num_representatives()
                ),
                format!("{} points and {} representatives", device_index.points, device_index.reps),
            ));
        }

        let mut batch = QueryBatch::new(queries.rows());
        let reps = device_index.reps as u32;
        let block_rows = self.query_rows_per_block(reps)?;
        let mut stats = QueryStats::default();
        let mut scored = Vec::new();
        for block in queries.row_blocks(block_rows) {
            let queries_buf = self.storage_init("Query Block Buffer", block.as_slice())?;
            let (plan, clipped) = self.plan_block(index, device_index, &block, &queries_buf, k, mode).await?;
            batch.advance(QueryPhase::ScoringCandidates)?;
            let arena = self.score_block(&block, &queries_buf, &device_index.database, &plan, k).await?;

            stats.candidates_scored += plan.total_work;
            stats.work_items += plan.items.len();
            stats.granularity = stats.granularity.max(plan.granularity);
            stats.clipped_radii += clipped;
            scored.push(ScoredBlock { arena, plan });
        }

        batch.advance(QueryPhase::Reducing)?;
        let neighbors: Vec<_> = scored
            .iter()
            .flat_map(|s| finalize(index, &s.arena, &s.plan))
            .collect();

        batch.advance(QueryPhase::Finalized)?;
        report_coverage_gaps(&neighbors);
        report_clipped_radii(stats.clipped_radii, queries.rows());

        let compute_time_ms = batch.elapsed_ms();
        info!(
            "Answered {} queries (k = {}, {:?}) in {:.2} ms",
            queries.rows(),
            k,
            mode,
            compute_time_ms
        );

        Ok(KnnResult {
            k,
            neighbors,
            stats,
            compute_time_ms: Some(compute_time_ms),
        })
    }

    /// Chooses candidate representatives for one query block and plans the scoring.
    async fn plan_block(
        &self,
        index: &RbcIndex,
        device_index: &DeviceIndex,
        block: &PointMatrix,
        queries_buf: &wgpu::Buffer,
        k: usize,
        mode: SearchMode,
    ) -> Result<(ComputePlan, usize)> {
        let q = block.rows() as u32;
        let reps = device_index.reps as u32;

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("RBC Query Distance Encoder"),
            });
        let dists = self.encode_distances(
            &mut encoder,
            queries_buf,
            &device_index.representatives,
            q,
            reps,
            0,
            block.dim() as u32,
        )?;

        let (candidates, clipped) = match mode {
            SearchMode::Budgeted(budget) => {
                let target = candidate_target(k, budget).min(u32::MAX as u64);
                let radii_buf = self.storage_output("Radii Buffer", q as u64)?;
                let counts_buf = self.storage_output("Counts Buffer", q as u64)?;
                self.encode_ranges(&mut encoder, &dists, &device_index.weights, &radii_buf, &counts_buf, target as u32)?;
                self.context.queue.submit(Some(encoder.finish()));

                let host_dists: Vec<f32> = self.read_buffer(&dists.buffer, (q * reps) as usize).await?;
                let radii: Vec<f32> = self.read_buffer(&radii_buf, q as usize).await?;
                let counts: Vec<u32> = self.read_buffer(&counts_buf, q as usize).await?;
                let ranges: Vec<RangeResult> = radii
                    .iter()
                    .zip(&counts)
                    .map(|(&r, &c)| RangeResult::from_device(r, c, target))
                    .collect();
                let clipped = ranges.iter().filter(|r| r.clipped).count();
                (select_in_range(&host_dists, reps as usize, &ranges), clipped)
            }
            SearchMode::Exact => {
                self.context.queue.submit(Some(encoder.finish()));
                let host_dists: Vec<f32> = self.read_buffer(&dists.buffer, (q * reps) as usize).await?;
                (select_exact(&host_dists, reps as usize, index.radii(), k), 0)
            }
        };

        let plan = ComputePlan::build(&candidates, index.owned_ranges(), &self.config)?;
        Ok((plan, clipped))
    }

    /// Runs `plan_knn` over a plan and reads the slots back.
    async fn score_block(
        &self,
        block: &PointMatrix,
        queries_buf: &wgpu::Buffer,
        db_buf: &wgpu::Buffer,
        plan: &ComputePlan,
        k: usize,
    ) -> Result<TopKArena> {
        if plan.items.is_empty() {
            return Ok(TopKArena::new(0, k));
        }
        let slots = plan.num_slots() as u64 * k as u64;
        if slots > self.context.max_binding_elements() {
            return Err(RbcError::NotSupported(format!(
                "{} output slots of {} neighbors exceed the device binding limit",
                plan.num_slots(),
                k
            )));
        }

        let items_buf = self.storage_init("Work Items Buffer", &plan.items)?;
        let out_dists = self.storage_output("Slot Distances Buffer", slots)?;
        let out_idx = self.storage_output("Slot Indices Buffer", slots)?;
        let params = self.uniform(
            "Plan Params",
            &PlanParams {
                num_items: plan.items.len() as u32,
                dim: block.dim() as u32,
                k: k as u32,
                _padding: 0,
            },
        );

        let bind_group = self.bind_group(
            "Plan KNN Bind Group",
            &self.pipelines.plan_knn,
            &[queries_buf, db_buf, &items_buf, &out_dists, &out_idx, &params],
        );
        let (x, y) = dispatch_dims(plan.items.len() as u32)?;

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("RBC Plan Encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Plan KNN Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipelines.plan_knn);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(x, y, 1);
        }
        self.context.queue.submit(Some(encoder.finish()));

        let dists: Vec<f32> = self.read_buffer(&out_dists, slots as usize).await?;
        let indices: Vec<u32> = self.read_buffer(&out_idx, slots as usize).await?;
        Ok(TopKArena::from_device(k, &dists, &indices))
    }

    /// Encodes one `compute_distances` pass over columns `b_offset..b_offset + cols` of `b`.
    #[allow(clippy::too_many_arguments)]
    fn encode_distances(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        a: &wgpu::Buffer,
        b: &wgpu::Buffer,
        rows: u32,
        cols: u32,
        b_offset: u32,
        dim: u32,
    ) -> Result<DistanceBlock> {
        let groups_x = cols.div_ceil(DISTANCE_TILE);
        let groups_y = rows.div_ceil(DISTANCE_TILE);
        if groups_x > MAX_DISPATCH || groups_y > MAX_DISPATCH {
            return Err(RbcError::NotSupported(format!(
                "{} x {} distance block exceeds the dispatch limit",
                rows, cols
            )));
        }

        let buffer = self.storage_output("Distance Block Buffer", rows as u64 * cols as u64)?;
        let params = self.uniform(
            "Distance Params",
            &DistanceParams {
                rows_a: rows,
                rows_b: cols,
                dim,
                b_offset,
            },
        );
        let bind_group = self.bind_group(
            "Distance Bind Group",
            &self.pipelines.distance,
            &[a, b, &buffer, &params],
        );

        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Distance Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipelines.distance);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }

        Ok(DistanceBlock { buffer, rows, cols })
    }

    /// Encodes `assign_owners` over a representative-by-point block.
    fn encode_assign(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        block: &DistanceBlock,
        owners: &wgpu::Buffer,
        owner_dists: &wgpu::Buffer,
        col_offset: u32,
    ) -> Result<()> {
        let params = self.uniform(
            "Assign Params",
            &AssignParams {
                rows: block.rows,
                cols: block.cols,
                col_offset,
                _padding: 0,
            },
        );
        let bind_group = self.bind_group(
            "Assign Bind Group",
            &self.pipelines.assign,
            &[&block.buffer, owners, owner_dists, &params],
        );
        let (x, y) = dispatch_dims(block.cols.div_ceil(self.config.workgroup_size))?;

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Assign Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipelines.assign);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
        Ok(())
    }

    /// Encodes `find_ranges`, one workgroup per row of `block`.
    fn encode_ranges(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        block: &DistanceBlock,
        weights: &wgpu::Buffer,
        radii: &wgpu::Buffer,
        counts: &wgpu::Buffer,
        target_count: u32,
    ) -> Result<()> {
        let params = self.uniform(
            "Range Params",
            &RangeParams {
                rows: block.rows,
                cols: block.cols,
                target_count,
                iterations: self.config.range_iterations,
            },
        );
        let bind_group = self.bind_group(
            "Range Bind Group",
            &self.pipelines.range,
            &[&block.buffer, weights, radii, counts, &params],
        );
        let (x, y) = dispatch_dims(block.rows)?;

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Range Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(&self.pipelines.range);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.dispatch_workgroups(x, y, 1);
        Ok(())
    }

    fn check_query(&self, index: &RbcIndex, queries: &PointMatrix, k: usize) -> Result<()> {
        validate_query(index, queries, k)?;
        if k as u32 > self.config.max_gpu_k {
            return Err(RbcError::NotSupported(format!(
                "k = {} exceeds the device limit of {}; use the host executor",
                k, self.config.max_gpu_k
            )));
        }
        Ok(())
    }

    fn check_points(&self, n: usize) -> Result<()> {
        if n > self.config.max_points as usize {
            return Err(RbcError::NotSupported(format!(
                "{} points exceeds the configured maximum of {}",
                n, self.config.max_points
            )));
        }
        Ok(())
    }

    /// Database columns per build pass so a `rows x cols` block fits one binding.
    fn columns_per_pass(&self, rows: u32) -> Result<u32> {
        let by_binding = self.context.max_binding_elements() / rows.max(1) as u64;
        let by_dispatch = (MAX_DISPATCH * DISTANCE_TILE) as u64;
        let cols = by_binding.min(by_dispatch) as u32;
        if cols == 0 {
            return Err(RbcError::NotSupported(format!(
                "{} representatives do not fit a single distance column",
                rows
            )));
        }
        Ok(cols)
    }

    /// Queries per block so the query-by-representative block fits one binding.
    fn query_rows_per_block(&self, reps: u32) -> Result<usize> {
        if reps > MAX_DISPATCH * DISTANCE_TILE {
            return Err(RbcError::NotSupported(format!(
                "{} representatives exceed the dispatch limit",
                reps
            )));
        }
        let by_binding = self.context.max_binding_elements() / reps.max(1) as u64;
        let rows = by_binding.min((MAX_DISPATCH * DISTANCE_TILE) as u64) as usize;
        if rows == 0 {
            return Err(RbcError::NotSupported(format!(
                "{} representatives do not fit a single distance row",
                reps
            )));
        }
        Ok(rows)
    }

    /// Uploads `data` into a read-only storage buffer.
    fn storage_init<T: Pod>(&self, label: &str, data: &[T]) -> Result<wgpu::Buffer> {
        let bytes: &[u8] = cast_slice(data);
        if bytes.len() as u64 > self.context.limits.max_storage_buffer_binding_size as u64 {
            return Err(RbcError::NotSupported(format!(
                "{} ({} bytes) exceeds the device binding limit",
                label,
                bytes.len()
            )));
        }
        // zero-sized bindings are invalid
        let padding = [0u8; 4];
        let contents = if bytes.is_empty() { &padding[..] } else { bytes };
        Ok(self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            }))
    }

    /// Allocates a storage buffer of `elements` 4-byte values for kernel output.
    fn storage_output(&self, label: &str, elements: u64) -> Result<wgpu::Buffer> {
        let size = elements.max(1) * 4;
        if size > self.context.limits.max_storage_buffer_binding_size as u64 {
            return Err(RbcError::BufferError(format!(
                "{} needs {} bytes, device binding limit is {}",
                label, size, self.context.limits.max_storage_buffer_binding_size
            )));
        }
        Ok(self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        }))
    }

    fn uniform<T: Pod>(&self, label: &str, value: &T) -> wgpu::Buffer {
        self.context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::bytes_of(value),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            })
    }

    /// Binds `buffers` to consecutive bindings of group 0.
    fn bind_group(&self, label: &str, pipeline: &wgpu::ComputePipeline, buffers: &[&wgpu::Buffer]) -> wgpu::BindGroup {
        let entries: Vec<wgpu::BindGroupEntry> = buffers
            .iter()
            .enumerate()
            .map(|(binding, buffer)| wgpu::BindGroupEntry {
                binding: binding as u32,
                resource: buffer.as_entire_binding(),
            })
            .collect();
        self.context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(label),
                layout: &pipeline.get_bind_group_layout(0),
                entries: &entries,
            })
    }

    /// Copies the first `len` elements of `buffer` back to the host.
    async fn read_buffer<T: Pod>(&self, buffer: &wgpu::Buffer, len: usize) -> Result<Vec<T>> {
        let size = (len * std::mem::size_of::<T>()) as u64;
        if size == 0 {
            return Ok(Vec::new());
        }
        let staging_buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Staging Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .context
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor::default());
        encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, size);
        self.context.queue.submit(Some(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (tx, rx) = futures::channel::oneshot::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.context
            .device
            .poll(wgpu::PollType::Wait)
            .map_err(|e| RbcError::ComputeError(format!("Failed to poll device: {}", e)))?;
        rx.await
            .map_err(|_| RbcError::TransferError("Readback channel closed".to_string()))??;

        let data = buffer_slice.get_mapped_range();
        let values: Vec<T> = cast_slice(&data).to_vec();
        drop(data);
        staging_buffer.unmap();

        Ok(values)
    }
}

/// Splits `groups` workgroups over a 2D grid with at most 65535 per dimension.
///
/// Kernels recover the linear id as `wid.x + wid.y * num_workgroups.x` and
/// skip ids past the real count.
pub fn dispatch_dims(groups: u32) -> Result<(u32, u32)> {
    let x = groups.clamp(1, MAX_DISPATCH);
    let y = groups.div_ceil(x).max(1);
    if y > MAX_DISPATCH {
        return Err(RbcError::NotSupported(format!(
            "{} workgroups exceed the dispatch limit",
            groups
        )));
    }
    Ok((x, y))
}

/// Creates all compute pipelines.
fn create_pipelines(device: &wgpu::Device, shaders: &CompiledShaders) -> ComputePipelines {
    let pipeline = |label: &str, module: &wgpu::ShaderModule, entry_point: &str| {
        device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(label),
            layout: None,
            module,
            entry_point: Some(entry_point),
            compilation_options: Default::default(),
            cache: None,
        })
    };

    ComputePipelines {
        distance: pipeline("Distance Pipeline", &shaders.distance, DISTANCE_ENTRY),
        range: pipeline("Range Pipeline", &shaders.range, RANGE_ENTRY),
        assign: pipeline("Assign Pipeline", &shaders.assign, ASSIGN_ENTRY),
        plan_knn: pipeline("Plan KNN Pipeline", &shaders.plan_knn, PLAN_KNN_ENTRY),
    }
}

// Work items are uploaded as raw words
const _: () = assert!(std::mem::size_of::<WorkItem>() == 32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_dims() {
        assert_eq!(dispatch_dims(0).unwrap(), (1, 1));
        assert_eq!(dispatch_dims(100).unwrap(), (100, 1));
        assert_eq!(dispatch_dims(65_535).unwrap(), (65_535, 1));
        let (x, y) = dispatch_dims(200_000).unwrap();
        assert_eq!(x, 65_535);
        assert!(x * y >= 200_000);
        assert!(dispatch_dims(u32::MAX).is_err());
    }

    #[tokio::test]
    async fn test_engine_rejects_large_k() {
        let Ok(gpu) = GpuContext::new().await else {
            eprintln!("No GPU available, skipping");
            return;
        };
        let engine = RbcCompute::with_optimal_config(gpu).unwrap();
        let rows: Vec<[f32; 2]> = (0..64).map(|i| [i as f32, 0.0]).collect();
        let db = PointMatrix::from_rows(&rows).unwrap();
        let index = engine.build_index(&db, 4, 1).await.unwrap();
        let result = engine.query(&index, &db, 33, 64).await;
        assert!(matches!(result, Err(RbcError::NotSupported(_))));
    }

    #[tokio::test]
    async fn test_resident_index_answers_repeated_batches() {
        let Ok(gpu) = GpuContext::new().await else {
            eprintln!("No GPU available, skipping");
            return;
        };
        let engine = RbcCompute::with_optimal_config(gpu).unwrap();
        let rows: Vec<[f32; 2]> = (0..200).map(|i| [(i % 20) as f32, (i / 20) as f32]).collect();
        let db = PointMatrix::from_rows(&rows).unwrap();
        let index = engine.build_index(&db, 10, 3).await.unwrap();
        let resident = engine.upload_index(&index).unwrap();
        assert_eq!(resident.len(), 200);
        assert_eq!(resident.num_representatives(), 10);

        let queries = db.gather(&[0, 57, 199]);
        let once = engine.query_exact(&index, &queries, 4).await.unwrap();
        for _ in 0..2 {
            let again = engine
                .run_query_resident(&index, &resident, &queries, 4, SearchMode::Exact)
                .await
                .unwrap();
            assert_eq!(again.neighbors, once.neighbors);
        }

        let other = engine.build_index(&db.gather(&(0..50).collect::<Vec<_>>()), 5, 3).await.unwrap();
        let result = engine
            .run_query_resident(&other, &resident, &queries, 4, SearchMode::Exact)
            .await;
        assert!(matches!(result, Err(RbcError::ShapeMismatch { .. })));
    }
}
