use crate::shared::{ErrorType, NetworkError, NetworkResult};
use byteorder::{ByteOrder, LittleEndian};

/// Scratch sizing hints a stage declares at registration: persistent
/// receive/send/shared regions plus the header bytes it prepends to every
/// outbound datagram.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct StageCapacities {
    pub receive: usize,
    pub send: usize,
    pub header: usize,
    pub shared: usize,
}

/// Out-parameters a stage raises while processing a buffer.
///
/// `resend` asks the driver to re-emit a prior outbound the stage has
/// reconstructed in its send scratch, framed as a little-endian u16 length
/// followed by the bytes. `update` re-runs the stage during the service
/// phase without new input. `error` drops the buffer and marks the
/// connection faulty.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct StageRequests {
    pub resend: bool,
    pub update: bool,
    pub error: bool,
}

/// The stage's persistent per-connection scratch regions.
pub struct StageIo<'a> {
    pub send_scratch: &'a mut [u8],
    pub receive_scratch: &'a mut [u8],
    pub shared_scratch: &'a mut [u8],
}

/// A window over a datagram in flight: `data[offset..offset + length]` is
/// the payload, and the bytes before `offset` are reserved header room.
/// Send stages prepend into the reservation; receive stages strip from the
/// front.
pub struct StageBuffer<'a> {
    data: &'a mut [u8],
    offset: usize,
    length: usize,
}

impl<'a> StageBuffer<'a> {
    #[inline]
    pub fn new(data: &'a mut [u8], offset: usize, length: usize) -> StageBuffer<'a> {
        debug_assert!(offset + length <= data.len());
        StageBuffer { data, offset, length }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.length
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Header room still available in front of the payload.
    #[inline]
    pub fn header_room(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.length]
    }

    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..self.offset + self.length]
    }

    /// Consumes header room to place bytes in front of the payload.
    pub fn prepend(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.offset {
            return false;
        }

        self.offset -= bytes.len();
        self.data[self.offset..self.offset + bytes.len()].copy_from_slice(bytes);
        self.length += bytes.len();

        true
    }

    /// Drops `count` bytes off the front of the payload.
    pub fn strip(&mut self, count: usize) -> bool {
        if count > self.length {
            return false;
        }

        self.offset += count;
        self.length -= count;

        true
    }
}

/// A pipeline stage, applied symmetrically to outbound and inbound
/// buffers. Stages are stateless by themselves; all per-connection state
/// lives in the scratch regions handed in through `StageIo`.
pub trait PipelineStage {
    fn capacities(&self) -> StageCapacities;

    /// Called once when a connection record materializes its scratch
    /// arenas. The regions arrive zeroed.
    fn initialize_connection(&self, _send: &mut [u8], _receive: &mut [u8], _shared: &mut [u8]) {}

    fn send(&self, io: StageIo<'_>, buffer: &mut StageBuffer<'_>, requests: &mut StageRequests);

    fn receive(&self, io: StageIo<'_>, buffer: &mut StageBuffer<'_>, requests: &mut StageRequests);
}

/// The no-op stage. Pads pipelines and backs the default Null pipeline.
pub struct NullStage;

impl PipelineStage for NullStage {
    fn capacities(&self) -> StageCapacities {
        StageCapacities::default()
    }

    fn send(&self, _io: StageIo<'_>, _buffer: &mut StageBuffer<'_>, _requests: &mut StageRequests) {}

    fn receive(&self, _io: StageIo<'_>, _buffer: &mut StageBuffer<'_>, _requests: &mut StageRequests) {}
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct PipelineId(pub u8);

/// The built-in empty pipeline raw Data datagrams flow through.
pub const NULL_PIPELINE: PipelineId = PipelineId(0);

#[derive(Copy, Clone)]
struct StagePlacement {
    stage: usize,
    arena_start: usize,
    capacities: StageCapacities,
}

pub struct Pipeline {
    placements: Vec<StagePlacement>,
    header_capacity: usize,
    arena_size: usize,
}

impl Pipeline {
    fn empty() -> Pipeline {
        Pipeline {
            placements: Vec::new(),
            header_capacity: 0,
            arena_size: 0,
        }
    }

    #[inline]
    pub fn stage_count(&self) -> usize {
        self.placements.len()
    }

    /// Total header bytes reserved in front of every outbound payload.
    #[inline]
    pub fn header_capacity(&self) -> usize {
        self.header_capacity
    }

    #[inline]
    pub fn arena_size(&self) -> usize {
        self.arena_size
    }
}

/// The aggregated outcome of running a buffer through a stage chain.
#[derive(Debug, Default)]
pub struct StageRun {
    pub error: bool,
    pub resends: Vec<usize>,
    pub updates: Vec<usize>,
}

/// Owns the registered stages and pipeline definitions. Pipeline id 0 is
/// always the Null pipeline. Definitions are fixed before connections
/// exist, so every record can materialize its arenas at creation.
pub struct PipelineRegistry {
    stages: Vec<Box<dyn PipelineStage>>,
    pipelines: Vec<Pipeline>,
}

impl PipelineRegistry {
    pub fn new() -> PipelineRegistry {
        PipelineRegistry {
            stages: Vec::new(),
            pipelines: vec![Pipeline::empty()],
        }
    }

    pub fn register_stage(&mut self, stage: Box<dyn PipelineStage>) -> usize {
        self.stages.push(stage);
        self.stages.len() - 1
    }

    pub fn create_pipeline(&mut self, stages: &[usize]) -> NetworkResult<PipelineId> {
        if self.pipelines.len() > usize::from(u8::max_value()) {
            return Err(NetworkError::Fatal(ErrorType::Capacity));
        }

        let mut placements = Vec::with_capacity(stages.len());
        let mut header_capacity = 0;
        let mut arena_start = 0;

        for &stage in stages {
            let capacities = match self.stages.get(stage) {
                Some(stage) => stage.capacities(),
                None => return Err(NetworkError::Fatal(ErrorType::UnknownStage)),
            };

            placements.push(StagePlacement {
                stage,
                arena_start,
                capacities,
            });

            header_capacity += capacities.header;
            arena_start += capacities.send + capacities.receive + capacities.shared;
        }

        self.pipelines.push(Pipeline {
            placements,
            header_capacity,
            arena_size: arena_start,
        });

        Ok(PipelineId((self.pipelines.len() - 1) as u8))
    }

    #[inline]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    #[inline]
    pub fn get(&self, id: PipelineId) -> NetworkResult<&Pipeline> {
        self.pipelines
            .get(usize::from(id.0))
            .ok_or(NetworkError::Fatal(ErrorType::UnknownPipeline))
    }

    /// Materializes one zeroed arena per pipeline for a new connection and
    /// runs each stage's initializer over its regions.
    pub fn allocate_arenas(&self) -> Vec<Vec<u8>> {
        let mut arenas = Vec::with_capacity(self.pipelines.len());

        for pipeline in self.pipelines.iter() {
            let mut arena = vec![0u8; pipeline.arena_size];

            for placement in pipeline.placements.iter() {
                let io = split_arena(&mut arena, placement);
                self.stages[placement.stage].initialize_connection(io.send_scratch, io.receive_scratch, io.shared_scratch);
            }

            arenas.push(arena);
        }

        arenas
    }

    /// Runs the send chain, stage N-1 down to stage 0, so the first
    /// stage's header lands outermost.
    pub fn run_send(&self, id: PipelineId, arena: &mut [u8], buffer: &mut StageBuffer<'_>) -> NetworkResult<StageRun> {
        let pipeline = self.get(id)?;
        let mut run = StageRun::default();

        for position in (0..pipeline.placements.len()).rev() {
            if self.run_stage(pipeline, position, arena, buffer, &mut run, true) {
                break;
            }
        }

        Ok(run)
    }

    /// Runs the receive chain, stage 0 up to stage N-1, stripping headers
    /// outer to inner.
    pub fn run_receive(&self, id: PipelineId, arena: &mut [u8], buffer: &mut StageBuffer<'_>) -> NetworkResult<StageRun> {
        let pipeline = self.get(id)?;
        let mut run = StageRun::default();

        for position in 0..pipeline.placements.len() {
            if self.run_stage(pipeline, position, arena, buffer, &mut run, false) {
                break;
            }
        }

        Ok(run)
    }

    /// Re-runs a single stage's send path without new input, for servicing
    /// `update` requests.
    pub fn run_stage_send(
        &self,
        id: PipelineId,
        position: usize,
        arena: &mut [u8],
        buffer: &mut StageBuffer<'_>,
    ) -> NetworkResult<StageRun> {
        let pipeline = self.get(id)?;

        if position >= pipeline.placements.len() {
            return Err(NetworkError::Fatal(ErrorType::UnknownStage));
        }

        let mut run = StageRun::default();
        self.run_stage(pipeline, position, arena, buffer, &mut run, true);

        Ok(run)
    }

    /// Reads the resend payload a stage left in its send scratch.
    pub fn resend_payload<'a>(&self, id: PipelineId, position: usize, arena: &'a [u8]) -> Option<&'a [u8]> {
        let pipeline = self.get(id).ok()?;
        let placement = pipeline.placements.get(position)?;

        if placement.capacities.send < 2 {
            return None;
        }

        let scratch = &arena[placement.arena_start..placement.arena_start + placement.capacities.send];
        let length = usize::from(LittleEndian::read_u16(&scratch[..2]));

        if 2 + length > scratch.len() {
            return None;
        }

        Some(&scratch[2..2 + length])
    }

    fn run_stage(
        &self,
        pipeline: &Pipeline,
        position: usize,
        arena: &mut [u8],
        buffer: &mut StageBuffer<'_>,
        run: &mut StageRun,
        sending: bool,
    ) -> bool {
        let placement = &pipeline.placements[position];
        let io = split_arena(arena, placement);
        let mut requests = StageRequests::default();

        let stage = &self.stages[placement.stage];
        if sending {
            stage.send(io, buffer, &mut requests);
        } else {
            stage.receive(io, buffer, &mut requests);
        }

        if requests.resend {
            run.resends.push(position);
        }
        if requests.update {
            run.updates.push(position);
        }
        if requests.error {
            run.error = true;
        }

        requests.error
    }
}

fn split_arena<'a>(arena: &'a mut [u8], placement: &StagePlacement) -> StageIo<'a> {
    let capacities = placement.capacities;

    let (_, tail) = arena.split_at_mut(placement.arena_start);
    let (send_scratch, tail) = tail.split_at_mut(capacities.send);
    let (receive_scratch, tail) = tail.split_at_mut(capacities.receive);
    let (shared_scratch, _) = tail.split_at_mut(capacities.shared);

    StageIo {
        send_scratch,
        receive_scratch,
        shared_scratch,
    }
}
