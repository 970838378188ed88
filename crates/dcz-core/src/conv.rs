use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

// im2col / col2im: sliding windows as a matrix
//
// Convolution and pooling both look at a K_h x K_w window sliding over the
// padded image. im2col copies every window out into a column buffer so the
// convolution becomes one matmul:
//
//   image [N, C, H, W]  ->  col [N, C, KH, KW, OH, OW]
//   matrix form          ->      [N*OH*OW, C*KH*KW]
//
//   OH = (H + 2*PH - KH) / SH + 1
//
// col2im is the exact adjoint: it scatter-adds every column entry back to
// the pixel it was copied from. Overlapping windows accumulate; entries that
// fell in the padding are dropped.

/// `(height, width)` pair for kernel, stride and padding arguments.
pub type Pair = (usize, usize);

/// Output extent of a convolution along one axis.
pub fn conv_outsize(size: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize> {
    if stride == 0 {
        return Err(Error::msg("convolution stride must be positive"));
    }
    if size + 2 * pad < kernel {
        return Err(Error::msg(format!(
            "kernel {kernel} larger than padded input {}",
            size + 2 * pad
        )));
    }
    Ok((size + 2 * pad - kernel) / stride + 1)
}

/// Output extent of a transposed convolution along one axis.
pub fn deconv_outsize(size: usize, kernel: usize, stride: usize, pad: usize) -> Result<usize> {
    if size == 0 {
        return Err(Error::msg("transposed convolution over an empty axis"));
    }
    let full = stride * (size - 1) + kernel;
    if full < 2 * pad {
        return Err(Error::msg(format!(
            "padding {pad} too large for transposed convolution output {full}"
        )));
    }
    Ok(full - 2 * pad)
}

fn dims4(t: &Tensor, what: &str) -> Result<[usize; 4]> {
    match *t.dims() {
        [a, b, c, d] => Ok([a, b, c, d]),
        _ => Err(Error::msg(format!(
            "{what}: expected a 4-D tensor, got shape {}",
            t.shape()
        ))),
    }
}

/// Iterate the window geometry of one image plane and call `f(col_pos,
/// pixel)` for every in-bounds `(ki, kj, oh, ow)`. `col_pos` is relative to
/// the `[KH, KW, OH, OW]` block of one (n, c) pair and `pixel` to its
/// `[H, W]` plane.
#[allow(clippy::too_many_arguments)]
#[inline]
fn for_each_window(
    h: usize,
    w: usize,
    (kh, kw): Pair,
    (sh, sw): Pair,
    (ph, pw): Pair,
    oh: usize,
    ow: usize,
    mut f: impl FnMut(usize, usize),
) {
    for ki in 0..kh {
        for kj in 0..kw {
            let row = (ki * kw + kj) * oh * ow;
            for y in 0..oh {
                let ih = (y * sh + ki) as isize - ph as isize;
                if ih < 0 || ih >= h as isize {
                    continue;
                }
                for x in 0..ow {
                    let iw = (x * sw + kj) as isize - pw as isize;
                    if iw >= 0 && iw < w as isize {
                        f(row + y * ow + x, ih as usize * w + iw as usize);
                    }
                }
            }
        }
    }
}

impl Tensor<f32> {
    /// Unfold sliding windows of a `[N, C, H, W]` image into columns.
    ///
    /// Returns `[N, C, KH, KW, OH, OW]`, or `[N*OH*OW, C*KH*KW]` when
    /// `to_matrix` is set. Padding reads as zero.
    pub fn im2col(&self, kernel: Pair, stride: Pair, pad: Pair, to_matrix: bool) -> Result<Self> {
        let [n, c, h, w] = dims4(self, "im2col")?;
        let oh = conv_outsize(h, kernel.0, stride.0, pad.0)?;
        let ow = conv_outsize(w, kernel.1, stride.1, pad.1)?;
        let (kh, kw) = kernel;

        let img = self.to_vec();
        let block = kh * kw * oh * ow;
        let mut col = vec![0.0f32; n * c * block];
        for plane in 0..n * c {
            let src = &img[plane * h * w..(plane + 1) * h * w];
            let dst = &mut col[plane * block..(plane + 1) * block];
            for_each_window(h, w, kernel, stride, pad, oh, ow, |pos, pix| {
                dst[pos] = src[pix];
            });
        }

        let col = Tensor::from_vec(col, vec![n, c, kh, kw, oh, ow])?;
        if to_matrix {
            col.permute(&[0, 4, 5, 1, 2, 3])?
                .reshape((n * oh * ow, c * kh * kw))
        } else {
            Ok(col)
        }
    }

    /// Fold columns back into an image of shape `image` (`[N, C, H, W]`),
    /// summing overlapping contributions. Exact adjoint of [`Tensor::im2col`]
    /// with the same arguments.
    pub fn col2im(
        &self,
        image: [usize; 4],
        kernel: Pair,
        stride: Pair,
        pad: Pair,
        to_matrix: bool,
    ) -> Result<Self> {
        let [n, c, h, w] = image;
        let oh = conv_outsize(h, kernel.0, stride.0, pad.0)?;
        let ow = conv_outsize(w, kernel.1, stride.1, pad.1)?;
        let (kh, kw) = kernel;

        let col = if to_matrix {
            let expected = Shape::from((n * oh * ow, c * kh * kw));
            if self.shape() != &expected {
                return Err(Error::shape_mismatch(&expected, self.shape()));
            }
            self.reshape(vec![n, oh, ow, c, kh, kw])?
                .permute(&[0, 3, 4, 5, 1, 2])?
        } else {
            let expected = Shape::new(vec![n, c, kh, kw, oh, ow]);
            if self.shape() != &expected {
                return Err(Error::shape_mismatch(&expected, self.shape()));
            }
            self.clone()
        };

        let cols = col.to_vec();
        let block = kh * kw * oh * ow;
        let mut img = vec![0.0f32; n * c * h * w];
        for plane in 0..n * c {
            let src = &cols[plane * block..(plane + 1) * block];
            let dst = &mut img[plane * h * w..(plane + 1) * h * w];
            for_each_window(h, w, kernel, stride, pad, oh, ow, |pos, pix| {
                dst[pix] += src[pos];
            });
        }
        Tensor::from_vec(img, image)
    }
}

// Convolution kernels (no autodiff; the differentiable wrappers live in
// functions::conv)

/// `y = conv(x, W) + b` for `x: [N, C, H, W]`, `W: [OC, C, KH, KW]`,
/// `b: [OC]`. Returns `[N, OC, OH, OW]`.
pub fn conv2d(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: Pair,
    pad: Pair,
) -> Result<Tensor> {
    let [n, c, h, w] = dims4(x, "conv2d input")?;
    let [oc, wc, kh, kw] = dims4(weight, "conv2d weight")?;
    if c != wc {
        return Err(Error::shape_mismatch(
            &Shape::from((oc, c, kh, kw)),
            weight.shape(),
        ));
    }
    let oh = conv_outsize(h, kh, stride.0, pad.0)?;
    let ow = conv_outsize(w, kw, stride.1, pad.1)?;

    let col = x.im2col((kh, kw), stride, pad, true)?;
    let w_mat = weight.reshape((oc, c * kh * kw))?.transpose(&[])?;
    let mut y = col.matmul(&w_mat)?;
    if let Some(b) = bias {
        y = y.add(b)?;
    }
    Ok(y
        .reshape((n, oh, ow, oc))?
        .permute(&[0, 3, 1, 2])?
        .contiguous())
}

/// Transposed convolution: the adjoint of [`conv2d`] with respect to its
/// input. `x: [N, OC, OH, OW]`, `W: [OC, C, KH, KW]`, `b: [C]`.
/// `out_hw` fixes the output extent; `None` uses [`deconv_outsize`].
pub fn deconv2d(
    x: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    stride: Pair,
    pad: Pair,
    out_hw: Option<Pair>,
) -> Result<Tensor> {
    let [n, xc, xh, xw] = dims4(x, "deconv2d input")?;
    let [oc, c, kh, kw] = dims4(weight, "deconv2d weight")?;
    if xc != oc {
        return Err(Error::shape_mismatch(
            &Shape::from((xc, c, kh, kw)),
            weight.shape(),
        ));
    }
    let (h, w) = match out_hw {
        Some(hw) => hw,
        None => (
            deconv_outsize(xh, kh, stride.0, pad.0)?,
            deconv_outsize(xw, kw, stride.1, pad.1)?,
        ),
    };
    let oh = conv_outsize(h, kh, stride.0, pad.0)?;
    let ow = conv_outsize(w, kw, stride.1, pad.1)?;
    if (oh, ow) != (xh, xw) {
        return Err(Error::msg(format!(
            "deconv2d: output {h}x{w} does not convolve back to {xh}x{xw}"
        )));
    }

    let x_mat = x.permute(&[0, 2, 3, 1])?.reshape((n * xh * xw, oc))?;
    let w_mat = weight.reshape((oc, c * kh * kw))?;
    let col = x_mat.matmul(&w_mat)?;
    let mut y = col.col2im([n, c, h, w], (kh, kw), stride, pad, true)?;
    if let Some(b) = bias {
        y = y.add(&b.reshape((1, c, 1, 1))?)?;
    }
    Ok(y)
}

/// Gradient of [`conv2d`] with respect to its weight: correlates the input
/// `x: [N, C, H, W]` with the output gradient `gy: [N, OC, OH, OW]`.
/// Returns `[OC, C, KH, KW]`.
pub fn conv2d_grad_w(
    x: &Tensor,
    gy: &Tensor,
    kernel: Pair,
    stride: Pair,
    pad: Pair,
) -> Result<Tensor> {
    let [n, c, _, _] = dims4(x, "conv2d_grad_w input")?;
    let [gn, oc, oh, ow] = dims4(gy, "conv2d_grad_w gradient")?;
    if gn != n {
        return Err(Error::shape_mismatch(x.shape(), gy.shape()));
    }
    let col = x.im2col(kernel, stride, pad, true)?;
    if col.dims()[0] != n * oh * ow {
        return Err(Error::msg(format!(
            "conv2d_grad_w: gradient {} does not match the output geometry of {}",
            gy.shape(),
            x.shape()
        )));
    }
    let gy_mat = gy.permute(&[1, 0, 2, 3])?.reshape((oc, n * oh * ow))?;
    gy_mat
        .matmul(&col)?
        .reshape((oc, c, kernel.0, kernel.1))
}

// Max pooling with saved argmax indices

/// Windows of `x` as `[N, C, KH*KW, OH, OW]`.
fn pool_windows(x: &Tensor, kernel: Pair, stride: Pair, pad: Pair) -> Result<Tensor> {
    let col = x.im2col(kernel, stride, pad, false)?;
    let d = col.dims().to_vec();
    col.reshape(vec![d[0], d[1], d[2] * d[3], d[4], d[5]])
}

/// Max pooling. Returns the pooled `[N, C, OH, OW]` tensor and the index of
/// the winning window element for every output position.
pub fn max_pool2d(
    x: &Tensor,
    kernel: Pair,
    stride: Pair,
    pad: Pair,
) -> Result<(Tensor, Tensor<i64>)> {
    let windows = pool_windows(x, kernel, stride, pad)?;
    let indexes = windows.argmax(2)?;
    let y = windows.max(&[2], false)?;
    Ok((y, indexes))
}

fn check_indexes(indexes: &Tensor<i64>, expected: &Shape, window: usize) -> Result<Vec<usize>> {
    if indexes.shape() != expected {
        return Err(Error::shape_mismatch(expected, indexes.shape()));
    }
    indexes
        .to_vec()
        .into_iter()
        .map(|i| {
            if i >= 0 && (i as usize) < window {
                Ok(i as usize)
            } else {
                Err(Error::IndexOutOfRange {
                    index: i.max(0) as usize,
                    dim: 2,
                    size: window,
                })
            }
        })
        .collect()
}

/// Route `gy: [N, C, OH, OW]` back to the argmax positions of an input of
/// shape `image`.
pub fn pool_scatter(
    gy: &Tensor,
    indexes: &Tensor<i64>,
    image: [usize; 4],
    kernel: Pair,
    stride: Pair,
    pad: Pair,
) -> Result<Tensor> {
    let [n, c, h, w] = image;
    let window = kernel.0 * kernel.1;
    let oh = conv_outsize(h, kernel.0, stride.0, pad.0)?;
    let ow = conv_outsize(w, kernel.1, stride.1, pad.1)?;
    let expected = Shape::from([n, c, oh, ow]);
    if gy.shape() != &expected {
        return Err(Error::shape_mismatch(&expected, gy.shape()));
    }
    let idx = check_indexes(indexes, gy.shape(), window)?;

    // [N, C, KH*KW, OH, OW] laid out plane by plane
    let plane = oh * ow;
    let mut col = vec![0.0f32; n * c * window * plane];
    for (pos, (&g, &k)) in gy.to_vec().iter().zip(&idx).enumerate() {
        let (nc, p) = (pos / plane, pos % plane);
        col[(nc * window + k) * plane + p] = g;
    }
    Tensor::from_vec(col, vec![n, c, kernel.0, kernel.1, oh, ow])?
        .col2im(image, kernel, stride, pad, false)
}

/// Pick the window elements named by `indexes` from `x`. Used as the
/// derivative of [`pool_scatter`].
pub fn pool_gather(
    x: &Tensor,
    indexes: &Tensor<i64>,
    kernel: Pair,
    stride: Pair,
    pad: Pair,
) -> Result<Tensor> {
    let windows = pool_windows(x, kernel, stride, pad)?;
    let d = windows.dims().to_vec();
    let (window, plane) = (d[2], d[3] * d[4]);
    let out_shape = Shape::new(vec![d[0], d[1], d[3], d[4]]);
    let idx = check_indexes(indexes, &out_shape, window)?;

    let vals = windows.to_vec();
    let out = idx
        .iter()
        .enumerate()
        .map(|(pos, &k)| {
            let (nc, p) = (pos / plane, pos % plane);
            vals[(nc * window + k) * plane + p]
        })
        .collect();
    Tensor::from_vec(out, out_shape)
}
