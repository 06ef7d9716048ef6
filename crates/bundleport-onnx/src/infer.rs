//! Best-effort shape inference for tensors the ONNX graph leaves untyped.
//!
//! Every function returns `None` when the answer is not known statically.

use bundleport_core::{Dim, Error, Result, Shape};

pub(crate) fn broadcast(a: Option<&Shape>, b: Option<&Shape>) -> Result<Option<Shape>> {
    let (Some(a), Some(b)) = (a, b) else {
        return Ok(None);
    };
    let rank = a.rank().max(b.rank());
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let da = dim_from_right(a, rank - 1 - i);
        let db = dim_from_right(b, rank - 1 - i);
        out.push(broadcast_dim(da, db).ok_or_else(|| {
            Error::InvalidModel(format!("cannot broadcast shapes {a} and {b}"))
        })?);
    }
    Ok(Some(Shape::from_dims(out)))
}

fn dim_from_right(s: &Shape, from_right: usize) -> Dim {
    let rank = s.rank();
    if from_right < rank {
        s.dims()[rank - 1 - from_right].clone()
    } else {
        Dim::Fixed(1)
    }
}

fn broadcast_dim(a: Dim, b: Dim) -> Option<Dim> {
    match (a, b) {
        (Dim::Fixed(1), other) | (other, Dim::Fixed(1)) => Some(other),
        (Dim::Fixed(x), Dim::Fixed(y)) if x == y => Some(Dim::Fixed(x)),
        (Dim::Fixed(_), Dim::Fixed(_)) => None,
        (Dim::Symbolic(x), Dim::Symbolic(y)) if x == y => Some(Dim::Symbolic(x)),
        (Dim::Fixed(n), _) | (_, Dim::Fixed(n)) => Some(Dim::Fixed(n)),
        _ => Some(Dim::Unknown),
    }
}

pub(crate) fn matmul(a: Option<&Shape>, b: Option<&Shape>) -> Result<Option<Shape>> {
    let (Some(a), Some(b)) = (a, b) else {
        return Ok(None);
    };
    let (a_dims, b_dims) = (a.dims(), b.dims());
    match (a_dims.len(), b_dims.len()) {
        (0, _) | (_, 0) => Err(Error::InvalidModel("MatMul on a scalar".to_string())),
        (1, 1) => Ok(Some(Shape::scalar())),
        (1, _) => {
            let mut out = b_dims[..b_dims.len() - 2].to_vec();
            out.push(b_dims[b_dims.len() - 1].clone());
            Ok(Some(Shape::from_dims(out)))
        }
        (_, 1) => Ok(Some(Shape::from_dims(a_dims[..a_dims.len() - 1].iter().cloned()))),
        (ra, rb) => {
            let batch_a = Shape::from_dims(a_dims[..ra - 2].iter().cloned());
            let batch_b = Shape::from_dims(b_dims[..rb - 2].iter().cloned());
            let batch = broadcast(Some(&batch_a), Some(&batch_b))?.unwrap_or_default();
            let mut out: Vec<Dim> = batch.dims().to_vec();
            out.push(a_dims[ra - 2].clone());
            out.push(b_dims[rb - 1].clone());
            Ok(Some(Shape::from_dims(out)))
        }
    }
}

pub(crate) fn gemm(a: Option<&Shape>, b: Option<&Shape>, trans_a: bool, trans_b: bool) -> Option<Shape> {
    let (a, b) = (a?, b?);
    if a.rank() != 2 || b.rank() != 2 {
        return None;
    }
    let m = if trans_a { &a.dims()[1] } else { &a.dims()[0] };
    let n = if trans_b { &b.dims()[0] } else { &b.dims()[1] };
    Some(Shape::from_dims([m.clone(), n.clone()]))
}

/// Resolves an ONNX `Reshape` target, honouring `0` (copy) and `-1` (infer).
pub(crate) fn reshape(input: Option<&Shape>, target: &[i64], allow_zero: bool) -> Result<Shape> {
    let mut out = Vec::with_capacity(target.len());
    let mut infer_at = None;
    for (i, &t) in target.iter().enumerate() {
        match t {
            -1 => {
                if infer_at.replace(i).is_some() {
                    return Err(Error::InvalidModel(
                        "reshape target has more than one -1".to_string(),
                    ));
                }
                out.push(Dim::Unknown);
            }
            0 if !allow_zero => {
                let copied = input
                    .and_then(|s| s.dims().get(i).cloned())
                    .unwrap_or(Dim::Unknown);
                out.push(copied);
            }
            n if n >= 0 => out.push(Dim::Fixed(n as usize)),
            n => {
                return Err(Error::InvalidModel(format!(
                    "invalid reshape target dimension {n}"
                )))
            }
        }
    }

    if let Some(idx) = infer_at {
        let total = input.and_then(Shape::numel);
        let known: Option<usize> = out
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != idx)
            .try_fold(1usize, |acc, (_, d)| acc.checked_mul(d.fixed()?));
        if let (Some(total), Some(known)) = (total, known) {
            if known == 0 || total % known != 0 {
                return Err(Error::InvalidModel(format!(
                    "cannot reshape {total} elements into {target:?}"
                )));
            }
            out[idx] = Dim::Fixed(total / known);
        } else if let Some(first) = input.and_then(|s| s.dims().first()) {
            // A leading -1 on a symbolic batch keeps the batch symbol.
            if idx == 0 && !matches!(first, Dim::Fixed(_)) && known.is_some() {
                out[idx] = first.clone();
            }
        }
    }
    Ok(Shape::from_dims(out))
}

/// `[prod(dims[..axis]), prod(dims[axis..])]`, as ONNX `Flatten` defines it.
/// Unknown products come back as `None`.
pub(crate) fn flatten(input: &Shape, axis: usize) -> (Option<usize>, Option<usize>) {
    let dims = input.dims();
    let prod = |ds: &[Dim]| {
        ds.iter()
            .try_fold(1usize, |acc, d| acc.checked_mul(d.fixed()?))
    };
    (prod(&dims[..axis]), prod(&dims[axis..]))
}

pub(crate) fn transpose(input: Option<&Shape>, perm: &[usize]) -> Option<Shape> {
    let input = input?;
    Some(Shape::from_dims(
        perm.iter().map(|&p| input.dims().get(p).cloned().unwrap_or(Dim::Unknown)),
    ))
}

pub(crate) fn concat(inputs: &[Option<&Shape>], axis: usize) -> Option<Shape> {
    let first = inputs.first().copied().flatten()?;
    let mut dims = first.dims().to_vec();
    let mut total = Some(0usize);
    for shape in inputs {
        let shape = (*shape)?;
        total = match (total, shape.dims().get(axis).and_then(Dim::fixed)) {
            (Some(t), Some(n)) => t.checked_add(n),
            _ => None,
        };
    }
    dims[axis] = total.map(Dim::Fixed).unwrap_or(Dim::Unknown);
    Some(Shape::from_dims(dims))
}

/// Output spatial size of a convolution or pooling window.
pub(crate) fn window_out(input: &Dim, kernel: usize, stride: usize, pad: usize, dilation: usize) -> Dim {
    match input {
        Dim::Fixed(n) => {
            let span = dilation
                .checked_mul(kernel.saturating_sub(1))
                .and_then(|s| s.checked_add(1));
            match (span, n.checked_add(pad)) {
                (Some(span), Some(padded)) if padded >= span && stride > 0 => {
                    Dim::Fixed((padded - span) / stride + 1)
                }
                _ => Dim::Unknown,
            }
        }
        _ => Dim::Unknown,
    }
}

pub(crate) fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved as usize >= rank.max(1) {
        return Err(Error::InvalidModel(format!(
            "axis {axis} out of range for rank {rank}"
        )));
    }
    Ok(resolved as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(d: &[usize]) -> Shape {
        Shape::from_slice(d)
    }

    #[test]
    fn broadcast_follows_numpy_rules() {
        let out = broadcast(Some(&s(&[1, 62])), Some(&s(&[62]))).unwrap();
        assert_eq!(out, Some(s(&[1, 62])));
        assert!(broadcast(Some(&s(&[3])), Some(&s(&[4]))).is_err());

        let batch = Shape::from_dims([Dim::Symbolic("N".into()), Dim::Fixed(10)]);
        let out = broadcast(Some(&batch), Some(&s(&[10]))).unwrap();
        assert_eq!(out, Some(batch));
    }

    #[test]
    fn matmul_shapes() {
        assert_eq!(matmul(Some(&s(&[1, 784])), Some(&s(&[784, 62]))).unwrap(), Some(s(&[1, 62])));
        assert_eq!(matmul(Some(&s(&[784])), Some(&s(&[784, 62]))).unwrap(), Some(s(&[62])));
        assert_eq!(
            matmul(Some(&s(&[5, 2, 3])), Some(&s(&[3, 4]))).unwrap(),
            Some(s(&[5, 2, 4]))
        );
    }

    #[test]
    fn reshape_resolves_minus_one_and_zero() {
        let out = reshape(Some(&s(&[2, 1, 28, 28])), &[0, -1], false).unwrap();
        assert_eq!(out, s(&[2, 784]));
        assert!(reshape(Some(&s(&[10])), &[3, -1], false).is_err());
    }

    #[test]
    fn conv_window() {
        assert_eq!(window_out(&Dim::Fixed(28), 5, 1, 0, 1), Dim::Fixed(24));
        assert_eq!(window_out(&Dim::Fixed(24), 2, 2, 0, 1), Dim::Fixed(12));
        assert_eq!(window_out(&Dim::Fixed(28), 3, 1, 2, 1), Dim::Fixed(28));
    }

    #[test]
    fn oversized_dims_become_unknown() {
        assert_eq!(window_out(&Dim::Fixed(usize::MAX), 3, 1, 2, 1), Dim::Unknown);
        assert_eq!(window_out(&Dim::Fixed(28), 3, 1, 0, usize::MAX), Dim::Unknown);

        let huge = s(&[1 << 40, 1 << 40, 1 << 40]);
        assert_eq!(flatten(&huge, 1), (Some(1 << 40), None));
        assert_eq!(reshape(Some(&huge), &[-1, 2], false).unwrap().dims()[0], Dim::Unknown);
    }
}
