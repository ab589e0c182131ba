/// 工具模块
/// Utility modules
pub mod colorspace;

/// 帧率 → 有理数 (num, den), 识别 NTSC 的 x/1.001 帧率
pub fn fps_to_rational(fps: f64) -> (u32, u32) {
    if !(fps.is_finite() && fps > 0.0) {
        return (25, 1);
    }
    let ntsc = fps * 1.001;
    if (ntsc - ntsc.round()).abs() < 1e-3 && (fps - fps.round()).abs() > 1e-3 {
        return ((ntsc.round() as u32) * 1000, 1001);
    }
    if (fps - fps.round()).abs() < 1e-6 {
        return (fps.round() as u32, 1);
    }
    let num = (fps * 1000.0).round() as u32;
    let g = gcd(num, 1000);
    (num / g, 1000 / g)
}

/// 解析 "30000/1001" 或 "25" 形式的帧率
pub fn parse_rational(s: &str) -> Option<f64> {
    let s = s.trim();
    match s.split_once('/') {
        Some((n, d)) => {
            let n: f64 = n.trim().parse().ok()?;
            let d: f64 = d.trim().parse().ok()?;
            (d != 0.0).then(|| n / d)
        }
        None => s.parse().ok(),
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}
