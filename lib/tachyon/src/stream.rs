use byteorder::{BigEndian, ByteOrder, NativeEndian};

const MAX_CODE_LENGTH: u32 = 6;
const BUCKET_COUNT: usize = 16;

/// Shared bucket and prefix-code tables for the packed integer encoding.
/// Values are split into a Huffman-coded bucket index followed by the raw
/// offset within the bucket. Codes are stored bit-reversed so they can be
/// written and peeked LSB-first like every other raw bit span.
pub struct CompressionModel {
    bucket_sizes: [u8; BUCKET_COUNT],
    bucket_offsets: [u32; BUCKET_COUNT],
    encode_table: [u16; BUCKET_COUNT],
    decode_table: [u16; 1 << MAX_CODE_LENGTH],
}

impl CompressionModel {
    const BUCKET_SIZES: [u8; BUCKET_COUNT] = [0, 0, 1, 2, 3, 4, 6, 8, 10, 12, 15, 18, 21, 24, 27, 32];
    const BUCKET_OFFSETS: [u32; BUCKET_COUNT] = [
        0, 1, 2, 4, 8, 16, 32, 96, 352, 1376, 5472, 38240, 300_384, 2_397_536, 19_174_752, 153_392_480,
    ];
    const SYMBOL_LENGTHS: [u8; BUCKET_COUNT] = [2, 3, 3, 3, 4, 4, 4, 5, 5, 5, 6, 6, 6, 6, 6, 6];

    pub fn new() -> CompressionModel {
        let mut encode_table = [0u16; BUCKET_COUNT];
        let mut decode_table = [0u16; 1 << MAX_CODE_LENGTH];

        // Canonical code assignment, shortest codes first, symbol order
        // within a length.
        let mut code: u32 = 0;
        for length in 1..=MAX_CODE_LENGTH {
            for symbol in 0..BUCKET_COUNT {
                if u32::from(Self::SYMBOL_LENGTHS[symbol]) != length {
                    continue;
                }

                let reversed = reverse_bits(code, length);
                encode_table[symbol] = ((reversed as u16) << 8) | length as u16;

                // Every peek pattern with this code in the low bits decodes
                // to the symbol.
                let mut pattern = reversed;
                while pattern < (1 << MAX_CODE_LENGTH) {
                    decode_table[pattern as usize] = ((symbol as u16) << 8) | length as u16;
                    pattern += 1 << length;
                }

                code += 1;
            }
            code <<= 1;
        }

        CompressionModel {
            bucket_sizes: Self::BUCKET_SIZES,
            bucket_offsets: Self::BUCKET_OFFSETS,
            encode_table,
            decode_table,
        }
    }

    /// The bucket whose range contains the value. Buckets partition the u32
    /// range contiguously, so a first-match scan is exact.
    #[inline]
    fn bucket(&self, value: u32) -> usize {
        for bucket in 0..BUCKET_COUNT {
            let offset = self.bucket_offsets[bucket];
            let bits = u32::from(self.bucket_sizes[bucket]);

            if value >= offset && (bits == 32 || value - offset < (1u32 << bits)) {
                return bucket;
            }
        }

        BUCKET_COUNT - 1
    }
}

impl Default for CompressionModel {
    fn default() -> CompressionModel {
        CompressionModel::new()
    }
}

#[inline]
fn reverse_bits(value: u32, length: u32) -> u32 {
    value.reverse_bits() >> (32 - length)
}

/// A byte buffer with a bit-granular write cursor. Bulk byte writes pad any
/// pending bits to a whole byte first; raw bit writes accumulate in a shift
/// register that is drained to the buffer a byte at a time.
///
/// Every write pre-checks the remaining capacity (growing first when the
/// stream is dynamic) and mutates nothing on failure; failures only bump
/// the `failed_writes` counter.
pub struct DataStream {
    data: Vec<u8>,
    size: usize,
    max_size: usize,
    dynamic: bool,
    byte_pos: usize,
    bit_buffer: u64,
    bit_pos: u32,
    failed_writes: usize,
}

impl DataStream {
    /// A fixed-capacity stream.
    #[inline]
    pub fn new(size: usize) -> DataStream {
        DataStream {
            data: vec![0; size],
            size,
            max_size: size,
            dynamic: false,
            byte_pos: 0,
            bit_buffer: 0,
            bit_pos: 0,
            failed_writes: 0,
        }
    }

    /// A stream that doubles its capacity on demand, up to `max_size`.
    #[inline]
    pub fn dynamic(size: usize, max_size: usize) -> DataStream {
        DataStream {
            data: vec![0; size],
            size,
            max_size,
            dynamic: true,
            byte_pos: 0,
            bit_buffer: 0,
            bit_pos: 0,
            failed_writes: 0,
        }
    }

    /// Length in whole bytes, counting a pending partial byte.
    #[inline]
    pub fn len(&self) -> usize {
        self.byte_pos + ((self.bit_pos as usize + 7) >> 3)
    }

    /// Length in bits.
    #[inline]
    pub fn length_bits(&self) -> usize {
        self.byte_pos * 8 + self.bit_pos as usize
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn failed_writes(&self) -> usize {
        self.failed_writes
    }

    #[inline]
    pub fn has_failed_writes(&self) -> bool {
        self.failed_writes > 0
    }

    /// The written bytes. The stream must be flushed.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        debug_assert_eq!(self.bit_pos, 0, "Stream read while bits are pending");
        &self.data[..self.byte_pos]
    }

    #[inline]
    pub fn clear(&mut self) {
        self.byte_pos = 0;
        self.bit_buffer = 0;
        self.bit_pos = 0;
        self.failed_writes = 0;
    }

    /// Pads any pending bits out to a whole byte.
    #[inline]
    pub fn flush(&mut self) {
        if self.bit_pos > 0 {
            // Capacity for the pad byte was reserved by the write that
            // admitted the pending bits.
            self.data[self.byte_pos] = self.bit_buffer as u8;
            self.byte_pos += 1;
            self.bit_buffer = 0;
            self.bit_pos = 0;
        }
    }

    /// Grows (when dynamic) until at least `needed` bytes fit.
    fn ensure(&mut self, needed: usize) -> bool {
        while needed > self.size {
            if !self.dynamic || self.size >= self.max_size {
                return false;
            }
            self.size = (self.size * 2).min(self.max_size);
            self.data.resize(self.size, 0);
        }

        true
    }

    #[inline]
    fn check_bytes(&mut self, count: usize) -> bool {
        let pending = if self.bit_pos > 0 { 1 } else { 0 };
        self.ensure(self.byte_pos + pending + count)
    }

    #[inline]
    fn check_bits(&mut self, bits: u32) -> bool {
        let needed = self.byte_pos + ((self.bit_pos + bits + 7) >> 3) as usize;
        self.ensure(needed)
    }

    /// Appends bits to the shift register and drains whole bytes. The
    /// caller has verified capacity and that the value fits in `bits`.
    fn push_bits(&mut self, value: u32, bits: u32) {
        let mask = (1u64 << bits) - 1;
        self.bit_buffer |= (u64::from(value) & mask) << self.bit_pos;
        self.bit_pos += bits;

        while self.bit_pos >= 8 {
            self.data[self.byte_pos] = self.bit_buffer as u8;
            self.byte_pos += 1;
            self.bit_buffer >>= 8;
            self.bit_pos -= 8;
        }
    }

    #[inline]
    fn fail(&mut self) -> bool {
        self.failed_writes += 1;
        false
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> bool {
        if !self.check_bytes(bytes.len()) {
            return self.fail();
        }

        self.flush();
        self.data[self.byte_pos..self.byte_pos + bytes.len()].copy_from_slice(bytes);
        self.byte_pos += bytes.len();

        true
    }

    #[inline]
    pub fn write_byte(&mut self, value: u8) -> bool {
        self.write_bytes(&[value])
    }

    #[inline]
    pub fn write_short(&mut self, value: i16) -> bool {
        let mut raw = [0u8; 2];
        NativeEndian::write_i16(&mut raw, value);
        self.write_bytes(&raw)
    }

    #[inline]
    pub fn write_ushort(&mut self, value: u16) -> bool {
        let mut raw = [0u8; 2];
        NativeEndian::write_u16(&mut raw, value);
        self.write_bytes(&raw)
    }

    #[inline]
    pub fn write_int(&mut self, value: i32) -> bool {
        let mut raw = [0u8; 4];
        NativeEndian::write_i32(&mut raw, value);
        self.write_bytes(&raw)
    }

    #[inline]
    pub fn write_uint(&mut self, value: u32) -> bool {
        let mut raw = [0u8; 4];
        NativeEndian::write_u32(&mut raw, value);
        self.write_bytes(&raw)
    }

    #[inline]
    pub fn write_ulong(&mut self, value: u64) -> bool {
        let mut raw = [0u8; 8];
        NativeEndian::write_u64(&mut raw, value);
        self.write_bytes(&raw)
    }

    #[inline]
    pub fn write_float(&mut self, value: f32) -> bool {
        self.write_uint(value.to_bits())
    }

    #[inline]
    pub fn write_ushort_network_byte_order(&mut self, value: u16) -> bool {
        let mut raw = [0u8; 2];
        BigEndian::write_u16(&mut raw, value);
        self.write_bytes(&raw)
    }

    #[inline]
    pub fn write_uint_network_byte_order(&mut self, value: u32) -> bool {
        let mut raw = [0u8; 4];
        BigEndian::write_u32(&mut raw, value);
        self.write_bytes(&raw)
    }

    #[inline]
    pub fn write_ulong_network_byte_order(&mut self, value: u64) -> bool {
        let mut raw = [0u8; 8];
        BigEndian::write_u64(&mut raw, value);
        self.write_bytes(&raw)
    }

    #[inline]
    pub fn write_float_network_byte_order(&mut self, value: f32) -> bool {
        self.write_uint_network_byte_order(value.to_bits())
    }

    /// Writes the low `bits` bits of the value, LSB-first. The value must
    /// fit in the requested width and `bits` must be at most 32.
    pub fn write_raw_bits(&mut self, value: u32, bits: u32) -> bool {
        if bits > 32 {
            return self.fail();
        }

        if bits < 32 && (value >> bits) != 0 {
            return self.fail();
        }

        if !self.check_bits(bits) {
            return self.fail();
        }

        self.push_bits(value, bits);

        true
    }

    pub fn write_packed_uint(&mut self, value: u32, model: &CompressionModel) -> bool {
        let bucket = model.bucket(value);
        let entry = model.encode_table[bucket];
        let code = u32::from(entry >> 8);
        let code_length = u32::from(entry & 0xff);
        let bits = u32::from(model.bucket_sizes[bucket]);

        if !self.check_bits(code_length + bits) {
            return self.fail();
        }

        self.push_bits(code, code_length);
        self.push_bits(value - model.bucket_offsets[bucket], bits);

        true
    }

    #[inline]
    pub fn write_packed_int(&mut self, value: i32, model: &CompressionModel) -> bool {
        // Zig-zag fold so small magnitudes of either sign land in the
        // small buckets.
        let folded = (value.wrapping_shl(1) ^ (value >> 31)) as u32;
        self.write_packed_uint(folded, model)
    }

    #[inline]
    pub fn write_packed_uint_delta(&mut self, value: u32, baseline: u32, model: &CompressionModel) -> bool {
        let diff = baseline.wrapping_sub(value) as i32;
        self.write_packed_int(diff, model)
    }

    #[inline]
    pub fn write_packed_int_delta(&mut self, value: i32, baseline: i32, model: &CompressionModel) -> bool {
        let diff = baseline.wrapping_sub(value);
        self.write_packed_int(diff, model)
    }

    #[inline]
    pub fn write_packed_float(&mut self, value: f32, model: &CompressionModel) -> bool {
        self.write_packed_float_delta(value, 0.0, model)
    }

    /// One bit for "unchanged", otherwise the full 32-bit pattern follows.
    pub fn write_packed_float_delta(&mut self, value: f32, baseline: f32, _model: &CompressionModel) -> bool {
        if value.to_bits() == baseline.to_bits() {
            return self.write_raw_bits(0, 1);
        }

        if !self.check_bits(33) {
            return self.fail();
        }

        self.push_bits(1, 1);
        self.push_bits(value.to_bits(), 32);

        true
    }

    /// A 16-bit length prefix followed by the raw bytes.
    pub fn write_string(&mut self, value: &str) -> bool {
        let bytes = value.as_bytes();

        if bytes.len() > usize::from(u16::max_value()) {
            return self.fail();
        }

        if !self.check_bytes(2 + bytes.len()) {
            return self.fail();
        }

        self.write_ushort(bytes.len() as u16);
        self.write_bytes(bytes);

        true
    }

    /// Writes the length delta followed by per-byte packed deltas against
    /// the baseline, with raw packed bytes past the baseline length. The
    /// whole write is rolled back when any part does not fit.
    pub fn write_packed_string_delta(&mut self, value: &str, baseline: &str, model: &CompressionModel) -> bool {
        let bytes = value.as_bytes();
        let base = baseline.as_bytes();

        let saved_byte_pos = self.byte_pos;
        let saved_bit_buffer = self.bit_buffer;
        let saved_bit_pos = self.bit_pos;
        let saved_failed = self.failed_writes;

        let mut ok = self.write_packed_uint_delta(bytes.len() as u32, base.len() as u32, model);

        for index in 0..bytes.len() {
            if !ok {
                break;
            }
            ok = if index < base.len() {
                self.write_packed_uint_delta(u32::from(bytes[index]), u32::from(base[index]), model)
            } else {
                self.write_packed_uint(u32::from(bytes[index]), model)
            };
        }

        if !ok {
            self.byte_pos = saved_byte_pos;
            self.bit_buffer = saved_bit_buffer;
            self.bit_pos = saved_bit_pos;
            self.failed_writes = saved_failed + 1;
            return false;
        }

        true
    }
}

/// Read cursor mirroring `DataStream`. Reads return zero/default values on
/// underflow and bump `failed_reads` instead of panicking.
pub struct Reader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_buffer: u64,
    bit_count: u32,
    failed_reads: usize,
}

impl<'a> Reader<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> Reader<'a> {
        Reader {
            data,
            byte_pos: 0,
            bit_buffer: 0,
            bit_count: 0,
            failed_reads: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Bits consumed so far. Matches the writer's bit length once the
    /// reader has mirrored every write.
    #[inline]
    pub fn bits_consumed(&self) -> usize {
        self.byte_pos * 8 - self.bit_count as usize
    }

    #[inline]
    pub fn failed_reads(&self) -> usize {
        self.failed_reads
    }

    #[inline]
    pub fn has_failed_reads(&self) -> bool {
        self.failed_reads > 0
    }

    /// Tops the shift register up with whole bytes, leaving headroom so a
    /// full 32-bit read never underflows while bytes remain.
    #[inline]
    fn fill_bit_buffer(&mut self) {
        while self.bit_count <= 56 && self.byte_pos < self.data.len() {
            self.bit_buffer |= u64::from(self.data[self.byte_pos]) << self.bit_count;
            self.byte_pos += 1;
            self.bit_count += 8;
        }
    }

    /// Drops the pad bits the writer emitted before a byte-aligned write.
    #[inline]
    fn align(&mut self) {
        let drop = self.bit_count % 8;
        self.bit_buffer >>= drop;
        self.bit_count -= drop;
    }

    pub fn read_raw_bits(&mut self, bits: u32) -> u32 {
        if bits > 32 {
            self.failed_reads += 1;
            return 0;
        }

        self.fill_bit_buffer();

        if self.bit_count < bits {
            self.failed_reads += 1;
            return 0;
        }

        let mask = (1u64 << bits) - 1;
        let value = (self.bit_buffer & mask) as u32;
        self.bit_buffer >>= bits;
        self.bit_count -= bits;

        value
    }

    pub fn read_bytes(&mut self, dest: &mut [u8]) -> bool {
        self.align();

        let buffered = (self.bit_count / 8) as usize;
        let available = buffered + self.data.len() - self.byte_pos;

        if available < dest.len() {
            for byte in dest.iter_mut() {
                *byte = 0;
            }
            self.failed_reads += 1;
            return false;
        }

        // Consume whole bytes parked in the shift register first.
        let mut index = 0;
        while self.bit_count >= 8 && index < dest.len() {
            dest[index] = self.bit_buffer as u8;
            self.bit_buffer >>= 8;
            self.bit_count -= 8;
            index += 1;
        }

        let remaining = dest.len() - index;
        dest[index..].copy_from_slice(&self.data[self.byte_pos..self.byte_pos + remaining]);
        self.byte_pos += remaining;

        true
    }

    #[inline]
    pub fn read_byte(&mut self) -> u8 {
        let mut raw = [0u8; 1];
        self.read_bytes(&mut raw);
        raw[0]
    }

    #[inline]
    pub fn read_short(&mut self) -> i16 {
        let mut raw = [0u8; 2];
        self.read_bytes(&mut raw);
        NativeEndian::read_i16(&raw)
    }

    #[inline]
    pub fn read_ushort(&mut self) -> u16 {
        let mut raw = [0u8; 2];
        self.read_bytes(&mut raw);
        NativeEndian::read_u16(&raw)
    }

    #[inline]
    pub fn read_int(&mut self) -> i32 {
        let mut raw = [0u8; 4];
        self.read_bytes(&mut raw);
        NativeEndian::read_i32(&raw)
    }

    #[inline]
    pub fn read_uint(&mut self) -> u32 {
        let mut raw = [0u8; 4];
        self.read_bytes(&mut raw);
        NativeEndian::read_u32(&raw)
    }

    #[inline]
    pub fn read_ulong(&mut self) -> u64 {
        let mut raw = [0u8; 8];
        self.read_bytes(&mut raw);
        NativeEndian::read_u64(&raw)
    }

    #[inline]
    pub fn read_float(&mut self) -> f32 {
        f32::from_bits(self.read_uint())
    }

    #[inline]
    pub fn read_ushort_network_byte_order(&mut self) -> u16 {
        let mut raw = [0u8; 2];
        self.read_bytes(&mut raw);
        BigEndian::read_u16(&raw)
    }

    #[inline]
    pub fn read_uint_network_byte_order(&mut self) -> u32 {
        let mut raw = [0u8; 4];
        self.read_bytes(&mut raw);
        BigEndian::read_u32(&raw)
    }

    #[inline]
    pub fn read_ulong_network_byte_order(&mut self) -> u64 {
        let mut raw = [0u8; 8];
        self.read_bytes(&mut raw);
        BigEndian::read_u64(&raw)
    }

    #[inline]
    pub fn read_float_network_byte_order(&mut self) -> f32 {
        f32::from_bits(self.read_uint_network_byte_order())
    }

    pub fn read_packed_uint(&mut self, model: &CompressionModel) -> u32 {
        self.fill_bit_buffer();

        let peek = (self.bit_buffer & ((1 << MAX_CODE_LENGTH) - 1)) as usize;
        let entry = model.decode_table[peek];
        let code_length = u32::from(entry & 0xff);

        if code_length == 0 || code_length > self.bit_count {
            self.failed_reads += 1;
            return 0;
        }

        self.bit_buffer >>= code_length;
        self.bit_count -= code_length;

        let symbol = usize::from(entry >> 8);
        let bits = u32::from(model.bucket_sizes[symbol]);

        model.bucket_offsets[symbol].wrapping_add(self.read_raw_bits(bits))
    }

    #[inline]
    pub fn read_packed_int(&mut self, model: &CompressionModel) -> i32 {
        let folded = self.read_packed_uint(model);
        ((folded >> 1) as i32) ^ -((folded & 1) as i32)
    }

    #[inline]
    pub fn read_packed_uint_delta(&mut self, baseline: u32, model: &CompressionModel) -> u32 {
        let diff = self.read_packed_int(model);
        baseline.wrapping_sub(diff as u32)
    }

    #[inline]
    pub fn read_packed_int_delta(&mut self, baseline: i32, model: &CompressionModel) -> i32 {
        let diff = self.read_packed_int(model);
        baseline.wrapping_sub(diff)
    }

    #[inline]
    pub fn read_packed_float(&mut self, model: &CompressionModel) -> f32 {
        self.read_packed_float_delta(0.0, model)
    }

    pub fn read_packed_float_delta(&mut self, baseline: f32, _model: &CompressionModel) -> f32 {
        if self.read_raw_bits(1) == 0 {
            return baseline;
        }

        f32::from_bits(self.read_raw_bits(32))
    }

    pub fn read_string(&mut self) -> String {
        let length = usize::from(self.read_ushort());

        let mut raw = vec![0u8; length];
        if !self.read_bytes(&mut raw) {
            return String::new();
        }

        String::from_utf8_lossy(&raw).into_owned()
    }

    pub fn read_packed_string_delta(&mut self, baseline: &str, model: &CompressionModel) -> String {
        let base = baseline.as_bytes();
        let length = self.read_packed_uint_delta(base.len() as u32, model) as usize;

        if length > usize::from(u16::max_value()) {
            self.failed_reads += 1;
            return String::new();
        }

        let mut raw = Vec::with_capacity(length);
        for index in 0..length {
            let byte = if index < base.len() {
                self.read_packed_uint_delta(u32::from(base[index]), model)
            } else {
                self.read_packed_uint(model)
            };
            raw.push(byte as u8);
        }

        String::from_utf8_lossy(&raw).into_owned()
    }
}
