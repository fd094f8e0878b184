//! Host↔device transfers
//!
//! Async entry points return a [`Sequence`]; synchronous ones wrap the same
//! recording with a fence wait. Sources and destinations are checked
//! against the pinned registry first: pinned host memory is used directly
//! as the staging buffer (zero-copy DMA), anything else goes through a
//! lazily-created staging sibling on the device buffer.

use std::sync::Arc;

use ash::vk;
use half::f16;

use crate::buffer::{sync_buffers, Buffer, PinnedRegistry, SubBuffer};
use crate::device::{Queue, Sequence, Submission};
use crate::error::Result;
use crate::tensor::{DType, Tensor};

pub(crate) fn align_size(width: usize, align: usize) -> usize {
    width.div_ceil(align) * align
}

/// Copy `height` rows of `width` bytes with source pitch `spitch` into a
/// densely packed destination.
pub(crate) fn stage_rows(dst: &mut [u8], src: &[u8], spitch: usize, width: usize, height: usize) {
    if width == spitch {
        dst[..width * height].copy_from_slice(&src[..width * height]);
        return;
    }
    for i in 0..height {
        dst[i * width..][..width].copy_from_slice(&src[i * spitch..][..width]);
    }
}

/// Copy rows into a destination with pitch `padded_width`, zero-filling the
/// padded tail of every row.
pub(crate) fn stage_rows_zeropad(
    dst: &mut [u8],
    src: &[u8],
    spitch: usize,
    width: usize,
    height: usize,
    padded_width: usize,
) {
    if width == padded_width && width == spitch {
        dst[..width * height].copy_from_slice(&src[..width * height]);
        return;
    }
    for i in 0..height {
        let row = &mut dst[i * padded_width..][..padded_width];
        row[..width].copy_from_slice(&src[i * spitch..][..width]);
        row[width..].fill(0);
    }
}

pub(crate) fn f32_to_f16_row(src: &[f32], dst: &mut [f16]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = f16::from_f32(*s);
    }
}

/// Record into `existing` (already begun; returns an empty sequence), or
/// create, begin, record, and end a fresh submission carrying
/// `wait`/`signal`.
fn record_submission(
    q: &Queue,
    wait: Vec<vk::Semaphore>,
    signal: Vec<vk::Semaphore>,
    existing: Option<&mut Submission>,
    record: impl FnOnce(vk::CommandBuffer),
) -> Result<Sequence> {
    match existing {
        Some(s) => {
            record(s.cmd);
            Ok(Sequence::new())
        }
        None => {
            let s = q.create_submission(wait, signal)?;
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { q.device().begin_command_buffer(s.cmd, &begin)? };
            record(s.cmd);
            unsafe { q.device().end_command_buffer(s.cmd)? };
            Ok(vec![s])
        }
    }
}

/// Asynchronous 2-D write of `height` rows of `width` bytes (source pitch
/// `spitch`) into `dst` at `offset`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn buffer_write_2d_async(
    dst: &Arc<Buffer>,
    offset: usize,
    src: *const u8,
    spitch: usize,
    width: usize,
    height: usize,
    q: &Queue,
    pinned: &PinnedRegistry,
    wait: Vec<vk::Semaphore>,
    signal: Vec<vk::Semaphore>,
    existing: Option<&mut Submission>,
) -> Result<Sequence> {
    assert!(
        !dst.host_visible(),
        "async write destination is host-visible; use the synchronous write"
    );

    let (src_buffer, regions) = match pinned.lookup(src) {
        Some((buf, buf_offset)) => {
            // Pinned host memory doubles as the staging buffer.
            let regions = if width == spitch {
                vec![vk::BufferCopy {
                    src_offset: buf_offset as u64,
                    dst_offset: offset as u64,
                    size: (width * height) as u64,
                }]
            } else {
                (0..height)
                    .map(|i| vk::BufferCopy {
                        src_offset: (buf_offset + i * spitch) as u64,
                        dst_offset: (offset + i * width) as u64,
                        size: width as u64,
                    })
                    .collect()
            };
            (buf, regions)
        }
        None => {
            let sb = dst.write_staging()?;
            let ptr = sb.host_ptr().unwrap();
            unsafe {
                let staged =
                    std::slice::from_raw_parts_mut(ptr.add(offset), width * height);
                let source =
                    std::slice::from_raw_parts(src, (height - 1) * spitch + width);
                stage_rows(staged, source, spitch, width, height);
            }
            let regions = vec![vk::BufferCopy {
                src_offset: offset as u64,
                dst_offset: offset as u64,
                size: (width * height) as u64,
            }];
            (sb, regions)
        }
    };

    record_submission(q, wait, signal, existing, |cmd| {
        sync_buffers(
            cmd,
            &[SubBuffer::whole(dst)],
            q,
            vk::AccessFlags::MEMORY_READ,
            vk::AccessFlags::MEMORY_WRITE,
            false,
        );
        unsafe {
            q.device()
                .cmd_copy_buffer(cmd, src_buffer.buffer, dst.buffer, &regions)
        };
    })
}

/// Asynchronous 2-D write padding every destination row to
/// `align_size(width, align)` bytes with zeros.
#[allow(clippy::too_many_arguments)]
pub(crate) fn buffer_write_2d_async_zeropad(
    dst: &Arc<Buffer>,
    offset: usize,
    src: *const u8,
    spitch: usize,
    width: usize,
    height: usize,
    align: usize,
    q: &Queue,
    pinned: &PinnedRegistry,
    wait: Vec<vk::Semaphore>,
    signal: Vec<vk::Semaphore>,
) -> Result<Sequence> {
    assert!(
        !dst.host_visible(),
        "zero-pad write destination is host-visible; use the synchronous write"
    );

    let padded_width = align_size(width, align);

    if let Some((buf, buf_offset)) = pinned.lookup(src) {
        // The copy skips the padded columns, so the destination is zeroed
        // first when padding is added.
        let regions = if width == padded_width && width == spitch {
            vec![vk::BufferCopy {
                src_offset: buf_offset as u64,
                dst_offset: offset as u64,
                size: (width * height) as u64,
            }]
        } else {
            (0..height)
                .map(|i| vk::BufferCopy {
                    src_offset: (buf_offset + i * spitch) as u64,
                    dst_offset: (offset + i * padded_width) as u64,
                    size: width as u64,
                })
                .collect()
        };

        return record_submission(q, wait, signal, None, |cmd| {
            sync_buffers(
                cmd,
                &[SubBuffer::whole(dst)],
                q,
                vk::AccessFlags::MEMORY_READ,
                vk::AccessFlags::MEMORY_WRITE,
                false,
            );
            if padded_width > width {
                unsafe {
                    q.device().cmd_fill_buffer(cmd, dst.buffer, 0, vk::WHOLE_SIZE, 0)
                };
                sync_buffers(
                    cmd,
                    &[SubBuffer::whole(dst)],
                    q,
                    vk::AccessFlags::MEMORY_WRITE,
                    vk::AccessFlags::MEMORY_WRITE,
                    true,
                );
            }
            unsafe { q.device().cmd_copy_buffer(cmd, buf.buffer, dst.buffer, &regions) };
        });
    }

    let sb = dst.write_staging()?;
    let ptr = sb.host_ptr().unwrap();
    unsafe {
        let staged = std::slice::from_raw_parts_mut(ptr.add(offset), padded_width * height);
        let source = std::slice::from_raw_parts(src, (height - 1) * spitch + width);
        stage_rows_zeropad(staged, source, spitch, width, height, padded_width);
    }
    let regions = [vk::BufferCopy {
        src_offset: offset as u64,
        dst_offset: offset as u64,
        size: (padded_width * height) as u64,
    }];

    record_submission(q, wait, signal, None, |cmd| {
        sync_buffers(
            cmd,
            &[SubBuffer::whole(dst)],
            q,
            vk::AccessFlags::MEMORY_READ,
            vk::AccessFlags::TRANSFER_WRITE,
            false,
        );
        unsafe { q.device().cmd_copy_buffer(cmd, sb.buffer, dst.buffer, &regions) };
    })
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn buffer_write_async(
    dst: &Arc<Buffer>,
    offset: usize,
    src: *const u8,
    size: usize,
    q: &Queue,
    pinned: &PinnedRegistry,
    wait: Vec<vk::Semaphore>,
    signal: Vec<vk::Semaphore>,
    existing: Option<&mut Submission>,
) -> Result<Sequence> {
    buffer_write_2d_async(dst, offset, src, size, size, 1, q, pinned, wait, signal, existing)
}

/// Synchronous 2-D write: direct memcpy for host-visible destinations,
/// fence-wrapped async write otherwise.
pub(crate) fn buffer_write_2d(
    dst: &Arc<Buffer>,
    offset: usize,
    src: *const u8,
    spitch: usize,
    width: usize,
    height: usize,
    q: &Queue,
    pinned: &PinnedRegistry,
) -> Result<()> {
    if let Some(ptr) = dst.host_ptr() {
        unsafe {
            let staged = std::slice::from_raw_parts_mut(ptr.add(offset), width * height);
            let source = std::slice::from_raw_parts(src, (height - 1) * spitch + width);
            stage_rows(staged, source, spitch, width, height);
        }
        return Ok(());
    }

    let seq = buffer_write_2d_async(
        dst,
        offset,
        src,
        spitch,
        width,
        height,
        q,
        pinned,
        Vec::new(),
        Vec::new(),
        None,
    )?;
    q.submit_and_wait(&mut vec![seq])
}

pub(crate) fn buffer_write(
    dst: &Arc<Buffer>,
    offset: usize,
    src: *const u8,
    size: usize,
    q: &Queue,
    pinned: &PinnedRegistry,
) -> Result<()> {
    buffer_write_2d(dst, offset, src, size, size, 1, q, pinned)
}

/// Asynchronous device→host read. The destination must be pinned: the
/// pinned buffer is the DMA target and the host sees the bytes through its
/// mapping once the sequence completes.
#[allow(clippy::too_many_arguments)]
pub(crate) fn buffer_read_async(
    src: &Arc<Buffer>,
    offset: usize,
    dst: *mut u8,
    size: usize,
    q: &Queue,
    pinned: &PinnedRegistry,
    wait: Vec<vk::Semaphore>,
    signal: Vec<vk::Semaphore>,
    existing: Option<&mut Submission>,
) -> Result<Sequence> {
    let Some((buf, buf_offset)) = pinned.lookup(dst) else {
        panic!("async read requires a pinned destination");
    };

    let regions = [vk::BufferCopy {
        src_offset: offset as u64,
        dst_offset: buf_offset as u64,
        size: size as u64,
    }];

    record_submission(q, wait, signal, existing, |cmd| {
        sync_buffers(
            cmd,
            &[SubBuffer::whole(src)],
            q,
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::MEMORY_READ,
            false,
        );
        unsafe { q.device().cmd_copy_buffer(cmd, src.buffer, buf.buffer, &regions) };
    })
}

/// Synchronous device→host read: mapped memcpy, pinned DMA, or a
/// read-staging bounce, whichever the destination allows.
pub(crate) fn buffer_read(
    src: &Arc<Buffer>,
    offset: usize,
    dst: *mut u8,
    size: usize,
    q: &Queue,
    pinned: &PinnedRegistry,
) -> Result<()> {
    if let Some(ptr) = src.host_ptr() {
        unsafe { std::ptr::copy_nonoverlapping(ptr.add(offset), dst, size) };
        return Ok(());
    }

    if pinned.lookup(dst).is_some() {
        let seq = buffer_read_async(
            src,
            offset,
            dst,
            size,
            q,
            pinned,
            Vec::new(),
            Vec::new(),
            None,
        )?;
        return q.submit_and_wait(&mut vec![seq]);
    }

    let sb = src.read_staging()?;
    let regions = [vk::BufferCopy {
        src_offset: offset as u64,
        dst_offset: 0,
        size: size as u64,
    }];
    let seq = record_submission(q, Vec::new(), Vec::new(), None, |cmd| {
        sync_buffers(
            cmd,
            &[SubBuffer::whole(src)],
            q,
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            false,
        );
        unsafe { q.device().cmd_copy_buffer(cmd, src.buffer, sb.buffer, &regions) };
    })?;
    q.submit_and_wait(&mut vec![seq])?;

    let ptr = sb.host_ptr().unwrap();
    unsafe { std::ptr::copy_nonoverlapping(ptr, dst, size) };
    Ok(())
}

/// Upload one `(i3, i2)` batch of a host tensor into `dst` at `offset`.
/// Rows must be element-contiguous; fully contiguous batches collapse to a
/// single 1-D write.
#[allow(clippy::too_many_arguments)]
pub(crate) fn h2d_tensor_2d(
    dst: &Arc<Buffer>,
    offset: usize,
    src: &Tensor,
    i3: i64,
    i2: i64,
    q: &Queue,
    pinned: &PinnedRegistry,
    wait: Vec<vk::Semaphore>,
    signal: Vec<vk::Semaphore>,
    existing: Option<&mut Submission>,
) -> Result<Sequence> {
    let ne0 = src.ne[0] as usize;
    let ne1 = src.ne[1] as usize;
    let nb0 = src.nb[0];
    let nb1 = src.nb[1];
    let nb2 = src.nb[2];
    let nb3 = src.nb[3];
    let ts = src.dtype.type_size();
    let row_length = src.dtype.row_size(ne0);

    let Some(base) = src.host_ptr() else {
        panic!("tensor upload requires host data");
    };
    let x = unsafe { base.add(i2 as usize * nb2 + i3 as usize * nb3) };

    if nb0 == ts && nb1 == row_length {
        return buffer_write_async(dst, offset, x, ne1 * nb1, q, pinned, wait, signal, existing);
    }
    if nb0 == ts {
        return buffer_write_2d_async(
            dst, offset, x, nb1, row_length, ne1, q, pinned, wait, signal, existing,
        );
    }
    panic!("tensor upload requires element-contiguous rows");
}

/// Upload one batch of an f32 host tensor converted to f16 on the fly. The
/// conversion runs on the host into the destination's write staging, then a
/// single device copy moves the rows over.
#[allow(clippy::too_many_arguments)]
pub(crate) fn h2d_tensor_2d_f32_to_f16(
    dst: &Arc<Buffer>,
    offset: usize,
    src: &Tensor,
    i3: i64,
    i2: i64,
    q: &Queue,
    wait: Vec<vk::Semaphore>,
    signal: Vec<vk::Semaphore>,
) -> Result<Sequence> {
    assert_eq!(src.dtype, DType::F32);

    let ne0 = src.ne[0] as usize;
    let ne1 = src.ne[1] as usize;
    let nb0 = src.nb[0];
    let nb1 = src.nb[1];
    let nb2 = src.nb[2];
    let nb3 = src.nb[3];

    let copy_size = std::mem::size_of::<f16>() * ne0 * ne1;

    let sb = dst.write_staging()?;
    let Some(base) = src.host_ptr() else {
        panic!("tensor upload requires host data");
    };

    unsafe {
        let tmp = std::slice::from_raw_parts_mut(
            sb.host_ptr().unwrap().add(offset) as *mut f16,
            ne0 * ne1,
        );
        let x = base.add(i2 as usize * nb2 + i3 as usize * nb3);
        if nb0 == 4 && nb1 == 4 * ne0 {
            let rows = std::slice::from_raw_parts(x as *const f32, ne0 * ne1);
            f32_to_f16_row(rows, tmp);
        } else if nb0 == 4 {
            for i1 in 0..ne1 {
                let row = std::slice::from_raw_parts(x.add(i1 * nb1) as *const f32, ne0);
                f32_to_f16_row(row, &mut tmp[i1 * ne0..][..ne0]);
            }
        } else {
            panic!("tensor upload requires element-contiguous rows");
        }
    }

    let regions = [vk::BufferCopy {
        src_offset: offset as u64,
        dst_offset: offset as u64,
        size: copy_size as u64,
    }];

    record_submission(q, wait, signal, None, |cmd| {
        sync_buffers(
            cmd,
            &[SubBuffer::new(dst, offset as u64, copy_size as u64)],
            q,
            vk::AccessFlags::MEMORY_READ,
            vk::AccessFlags::TRANSFER_WRITE,
            false,
        );
        unsafe { q.device().cmd_copy_buffer(cmd, sb.buffer, dst.buffer, &regions) };
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_size_rounds_up() {
        assert_eq!(align_size(466, 256), 512);
        assert_eq!(align_size(512, 256), 512);
        assert_eq!(align_size(1, 64), 64);
        assert_eq!(align_size(0, 64), 0);
    }

    #[test]
    fn stage_rows_packs_strided_source() {
        let src = [1u8, 2, 0, 0, 3, 4, 0, 0, 5, 6];
        let mut dst = [0u8; 6];
        stage_rows(&mut dst, &src, 4, 2, 3);
        assert_eq!(dst, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn stage_rows_zeropad_zeroes_the_tail() {
        let src = [1u8, 2, 3, 4, 5, 6];
        let mut dst = [0xFFu8; 12];
        stage_rows_zeropad(&mut dst, &src, 3, 3, 2, 6);
        assert_eq!(dst, [1, 2, 3, 0, 0, 0, 4, 5, 6, 0, 0, 0]);
    }

    #[test]
    fn stage_rows_zeropad_contiguous_fast_path() {
        let src = [7u8; 8];
        let mut dst = [0u8; 8];
        stage_rows_zeropad(&mut dst, &src, 4, 4, 2, 4);
        assert_eq!(dst, [7; 8]);
    }

    #[test]
    fn f16_row_conversion() {
        let src = [0.0f32, 1.0, -2.5, 65504.0];
        let mut dst = [f16::ZERO; 4];
        f32_to_f16_row(&src, &mut dst);
        for (s, d) in src.iter().zip(dst.iter()) {
            assert_eq!(*s, d.to_f32());
        }
    }
}
