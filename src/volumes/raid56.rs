//! RAID5/6 校验计算与重建
//!
//! P 为数据条带的异或；Q 为 GF(2^8)（多项式 0x11d）上的 Reed-Solomon 校验，
//! `Q = Σ g^i · D_i`，g = 2。

use crate::error::{Error, ErrorKind, Result};
use alloc::vec;
use alloc::vec::Vec;

#[inline]
fn gf_mul2(x: u8) -> u8 {
    (x << 1) ^ if x & 0x80 != 0 { 0x1d } else { 0 }
}

fn gf_mul(mut a: u8, mut b: u8) -> u8 {
    let mut out = 0u8;
    while b != 0 {
        if b & 1 != 0 {
            out ^= a;
        }
        a = gf_mul2(a);
        b >>= 1;
    }
    out
}

fn gf_pow2(mut exp: u32) -> u8 {
    exp %= 255;
    let mut out = 1u8;
    for _ in 0..exp {
        out = gf_mul2(out);
    }
    out
}

fn check_lengths(data: &[&[u8]]) -> Result<usize> {
    let len = data.first().map(|d| d.len()).unwrap_or(0);
    if data.is_empty() || data.iter().any(|d| d.len() != len) {
        return Err(Error::new(ErrorKind::InvalidInput, "stripe lengths differ"));
    }
    Ok(len)
}

/// 计算 P 校验
pub fn gen_p(data: &[&[u8]]) -> Result<Vec<u8>> {
    let len = check_lengths(data)?;
    let mut p = vec![0u8; len];
    for stripe in data {
        for (dst, src) in p.iter_mut().zip(stripe.iter()) {
            *dst ^= *src;
        }
    }
    Ok(p)
}

/// 计算 Q 校验（Horner 法，从最高编号的数据条带开始）
pub fn gen_q(data: &[&[u8]]) -> Result<Vec<u8>> {
    let len = check_lengths(data)?;
    let mut q = vec![0u8; len];
    for stripe in data.iter().rev() {
        for (dst, src) in q.iter_mut().zip(stripe.iter()) {
            *dst = gf_mul2(*dst) ^ *src;
        }
    }
    Ok(q)
}

/// 同时计算 P 与 Q
pub fn gen_pq(data: &[&[u8]]) -> Result<(Vec<u8>, Vec<u8>)> {
    Ok((gen_p(data)?, gen_q(data)?))
}

/// 用 P 重建第 `failed` 个数据条带
///
/// `data[failed]` 的内容被忽略。
pub fn rebuild_from_p(data: &[&[u8]], p: &[u8], failed: usize) -> Result<Vec<u8>> {
    let len = check_lengths(data)?;
    if failed >= data.len() || p.len() != len {
        return Err(Error::new(ErrorKind::InvalidInput, "bad rebuild request"));
    }
    let mut out = p.to_vec();
    for (i, stripe) in data.iter().enumerate() {
        if i == failed {
            continue;
        }
        for (dst, src) in out.iter_mut().zip(stripe.iter()) {
            *dst ^= *src;
        }
    }
    Ok(out)
}

/// 用 Q 重建第 `failed` 个数据条带
///
/// 把失效条带视为全零重新计算 Q'，则 `Q ^ Q' = g^failed · D_failed`。
pub fn rebuild_from_q(data: &[&[u8]], q: &[u8], failed: usize) -> Result<Vec<u8>> {
    let len = check_lengths(data)?;
    if failed >= data.len() || q.len() != len {
        return Err(Error::new(ErrorKind::InvalidInput, "bad rebuild request"));
    }
    let zero = vec![0u8; len];
    let mut rest: Vec<&[u8]> = data.to_vec();
    rest[failed] = zero.as_slice();
    let partial = gen_q(&rest)?;

    let inv = gf_pow2(255 - (failed as u32 % 255));
    Ok(q.iter()
        .zip(partial.iter())
        .map(|(a, b)| gf_mul(*a ^ *b, inv))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stripes() -> Vec<Vec<u8>> {
        (0..4u8)
            .map(|i| (0..64u8).map(|b| b.wrapping_mul(31).wrapping_add(i * 17)).collect())
            .collect()
    }

    #[test]
    fn test_gf_inverse() {
        for x in 0..8u32 {
            assert_eq!(gf_mul(gf_pow2(x), gf_pow2(255 - x)), 1);
        }
        assert_eq!(gf_mul2(0x80), 0x1d);
    }

    #[test]
    fn test_rebuild_from_p() {
        let data = stripes();
        let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
        let p = gen_p(&refs).unwrap();
        let rebuilt = rebuild_from_p(&refs, &p, 2).unwrap();
        assert_eq!(rebuilt, data[2]);
    }

    #[test]
    fn test_rebuild_from_q() {
        let data = stripes();
        let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
        let (_, q) = gen_pq(&refs).unwrap();
        for failed in 0..data.len() {
            let mut damaged = refs.clone();
            let junk = vec![0xa5u8; 64];
            damaged[failed] = junk.as_slice();
            let rebuilt = rebuild_from_q(&damaged, &q, failed).unwrap();
            assert_eq!(rebuilt, data[failed]);
        }
    }

    #[test]
    fn test_length_mismatch() {
        let a = [1u8; 4];
        let b = [1u8; 3];
        assert!(gen_p(&[&a[..], &b[..]]).is_err());
    }
}
