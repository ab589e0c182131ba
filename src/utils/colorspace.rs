/// YUV ↔ RGB 转换 (BT.601 全范围, 整数定点 >>7)
///
/// 平面格式, 色度按 `(cw, ch)` 下采样:
/// - 4:4:4 → (1, 1)
/// - 4:2:0 → (2, 2)

/// 色度平面尺寸
pub fn chroma_size(width: usize, height: usize, sub: (usize, usize)) -> (usize, usize) {
    (width.div_ceil(sub.0), height.div_ceil(sub.1))
}

/// 一帧 YUV 平面格式的总字节数
pub fn yuv_frame_len(width: usize, height: usize, sub: (usize, usize)) -> usize {
    let (cw, ch) = chroma_size(width, height, sub);
    width * height + 2 * cw * ch
}

/// 平面 YUV → 紧凑 RGB24
pub fn yuv_planar_to_rgb(
    src: &[u8],
    width: usize,
    height: usize,
    sub: (usize, usize),
    rgb: &mut Vec<u8>,
) {
    let (cw, ch) = chroma_size(width, height, sub);
    let (y_plane, rest) = src.split_at(width * height);
    let (u_plane, v_plane) = rest.split_at(cw * ch);

    rgb.clear();
    rgb.reserve(width * height * 3);
    for y in 0..height {
        let y_row = y * width;
        let uv_row = (y / sub.1) * cw;
        for x in 0..width {
            let y_val = y_plane[y_row + x] as i32;
            let u_val = u_plane[uv_row + x / sub.0] as i32 - 128;
            let v_val = v_plane[uv_row + x / sub.0] as i32 - 128;

            rgb.push((y_val + ((v_val * 179) >> 7)).clamp(0, 255) as u8);
            rgb.push((y_val - ((u_val * 44) >> 7) - ((v_val * 91) >> 7)).clamp(0, 255) as u8);
            rgb.push((y_val + ((u_val * 227) >> 7)).clamp(0, 255) as u8);
        }
    }
}

/// 紧凑 RGB24 → 平面 YUV 4:4:4
pub fn rgb_to_yuv444(rgb: &[u8], out: &mut Vec<u8>) {
    let n = rgb.len() / 3;
    out.clear();
    out.resize(n * 3, 0);
    let (y_plane, rest) = out.split_at_mut(n);
    let (u_plane, v_plane) = rest.split_at_mut(n);
    for (i, px) in rgb.chunks_exact(3).enumerate() {
        let (r, g, b) = (px[0] as i32, px[1] as i32, px[2] as i32);
        // 0.299 / 0.587 / 0.114, 以 128 为定点
        y_plane[i] = ((38 * r + 75 * g + 15 * b + 64) >> 7).clamp(0, 255) as u8;
        u_plane[i] = (((-22 * r - 42 * g + 64 * b + 64) >> 7) + 128).clamp(0, 255) as u8;
        v_plane[i] = (((64 * r - 54 * g - 10 * b + 64) >> 7) + 128).clamp(0, 255) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_len() {
        assert_eq!(yuv_frame_len(4, 4, (1, 1)), 48);
        assert_eq!(yuv_frame_len(4, 4, (2, 2)), 24);
        assert_eq!(yuv_frame_len(5, 3, (2, 2)), 15 + 2 * 6);
    }

    #[test]
    fn test_gray_roundtrip_is_exact() {
        let rgb: Vec<u8> = [0u8, 60, 128, 200, 255]
            .iter()
            .flat_map(|&v| [v, v, v])
            .collect();
        let mut yuv = Vec::new();
        rgb_to_yuv444(&rgb, &mut yuv);
        let mut back = Vec::new();
        yuv_planar_to_rgb(&yuv, 5, 1, (1, 1), &mut back);
        assert_eq!(back, rgb);
    }

    #[test]
    fn test_color_roundtrip_close() {
        let rgb = vec![255, 0, 0, 0, 255, 0, 0, 0, 255, 30, 144, 255];
        let mut yuv = Vec::new();
        rgb_to_yuv444(&rgb, &mut yuv);
        let mut back = Vec::new();
        yuv_planar_to_rgb(&yuv, 4, 1, (1, 1), &mut back);
        for (a, b) in rgb.iter().zip(back.iter()) {
            assert!((*a as i32 - *b as i32).abs() <= 8, "{a} vs {b}");
        }
    }

    #[test]
    fn test_420_shares_chroma() {
        // 2x2 亮度不同, 共用一组中性色度
        let yuv = vec![10, 20, 30, 40, 128, 128];
        let mut rgb = Vec::new();
        yuv_planar_to_rgb(&yuv, 2, 2, (2, 2), &mut rgb);
        assert_eq!(rgb, vec![10, 10, 10, 20, 20, 20, 30, 30, 30, 40, 40, 40]);
    }
}
