use super::*;
use crate::header::HeaderValue;

const TOLERANCE: f64 = 1e-6;
const SCALE: f64 = 2.8e-4;

fn tan_header(projection: &str, crval: [f64; 2]) -> Header {
    let mut header = Header::new();
    header.insert("NAXIS", 2_i64);
    header.insert("NAXIS1", 1000_i64);
    header.insert("NAXIS2", 1000_i64);
    header.insert("CTYPE1", format!("RA---{projection}"));
    header.insert("CTYPE2", format!("DEC--{projection}"));
    header.insert("CRPIX1", 500.5);
    header.insert("CRPIX2", 500.5);
    header.insert("CRVAL1", crval[0]);
    header.insert("CRVAL2", crval[1]);
    header.insert("CD1_1", -SCALE);
    header.insert("CD1_2", 0.0);
    header.insert("CD2_1", 0.0);
    header.insert("CD2_2", SCALE);
    header
}

fn assert_close(a: f64, b: f64, tolerance: f64) {
    assert!((a - b).abs() < tolerance, "expected {a} ~= {b} (diff = {})", (a - b).abs());
}

#[test]
fn test_reference_pixel_maps_to_reference_value() {
    let wcs = Wcs::new(&tan_header("TAN", [150.0, 30.0]));
    assert!(wcs.is_valid());

    let [ra_hours, dec] = wcs.pix_to_world([500.5, 500.5]).unwrap();
    assert_close(ra_hours, 10.0, 1e-9);
    assert_close(dec, 30.0, 1e-9);
}

#[test]
fn test_round_trip_all_projections() {
    for projection in ["TAN", "SIN", "ARC", "STG", "ZEA"] {
        let wcs = Wcs::new(&tan_header(projection, [150.0, 30.0]));
        assert!(wcs.is_valid(), "{projection} should initialize");

        for x in (0..=1000).step_by(125) {
            for y in (0..=1000).step_by(125) {
                let pixel = [x as f64, y as f64];
                let world = wcs.pix_to_world(pixel).unwrap();
                let back = wcs.world_to_pix(world).unwrap();
                assert_close(back[0], pixel[0], TOLERANCE);
                assert_close(back[1], pixel[1], TOLERANCE);
            }
        }
    }
}

#[test]
fn test_tan_matches_gnomonic_formula() {
    let wcs = Wcs::new(&tan_header("TAN", [150.0, 30.0]));
    let (ra, dec) = (150.1f64, 30.05f64);

    let (a0, d0) = (150f64.to_radians(), 30f64.to_radians());
    let (a, d) = (ra.to_radians(), dec.to_radians());
    let denominator = d.sin() * d0.sin() + d.cos() * d0.cos() * (a - a0).cos();
    let xi = (d.cos() * (a - a0).sin() / denominator).to_degrees();
    let eta = ((d.sin() * d0.cos() - d.cos() * d0.sin() * (a - a0).cos()) / denominator).to_degrees();

    let [x, y] = wcs.world_to_pix([ra / 15.0, dec]).unwrap();
    assert_close(x, xi / -SCALE + 500.5, TOLERANCE);
    assert_close(y, eta / SCALE + 500.5, TOLERANCE);
}

#[test]
fn test_east_is_left() {
    let wcs = Wcs::new(&tan_header("TAN", [150.0, 30.0]));
    let [ra_left, _] = wcs.pix_to_world([400.0, 500.5]).unwrap();
    let [ra_right, _] = wcs.pix_to_world([600.0, 500.5]).unwrap();
    assert!(ra_left > ra_right);

    let [_, dec_top] = wcs.pix_to_world([500.5, 600.0]).unwrap();
    assert!(dec_top > 30.0);
}

#[test]
fn test_pc_cdelt_equivalent_to_cd() {
    let cd = Wcs::new(&tan_header("TAN", [150.0, 30.0]));

    let mut header = tan_header("TAN", [150.0, 30.0]);
    for key in ["CD1_1", "CD1_2", "CD2_1", "CD2_2"] {
        header.remove(key);
    }
    header.insert("CDELT1", -SCALE);
    header.insert("CDELT2", SCALE);
    header.insert("PC1_1", 1.0);
    header.insert("PC2_2", 1.0);
    let pc = Wcs::new(&header);

    let a = cd.pix_to_world([12.0, 870.0]).unwrap();
    let b = pc.pix_to_world([12.0, 870.0]).unwrap();
    assert_close(a[0], b[0], 1e-12);
    assert_close(a[1], b[1], 1e-12);
    assert_eq!(cd.linear(), pc.linear());
}

#[test]
fn test_crota_rotation() {
    let mut header = tan_header("TAN", [10.0, -45.0]);
    for key in ["CD1_1", "CD1_2", "CD2_1", "CD2_2"] {
        header.remove(key);
    }
    header.insert("CRPIX1", 100.0);
    header.insert("CRPIX2", 200.0);
    header.insert("CDELT1", -SCALE);
    header.insert("CDELT2", SCALE);
    header.insert("CROTA2", 30.0);

    let wcs = Wcs::new(&header);
    let [ra_hours, dec] = wcs.pix_to_world([1.0, 1.0]).unwrap();
    assert_close(ra_hours * 15.0, 10.073393936300791, 1e-9);
    assert_close(dec, -45.034371427596476, 1e-9);

    assert_close(wcs.position_angle().unwrap(), 330.0, 1e-9);
    assert_close(wcs.pixel_scale().unwrap(), SCALE * 30f64.to_radians().cos(), 1e-15);
}

#[test]
fn test_geometry_queries() {
    let wcs = Wcs::new(&tan_header("TAN", [150.0, 30.0]));
    assert_close(wcs.pixel_scale().unwrap(), SCALE, 1e-15);
    assert_eq!(wcs.is_flipped(), Some(true));
    assert_close(wcs.position_angle().unwrap(), 0.0, 1e-12);

    let mut header = tan_header("TAN", [150.0, 30.0]);
    header.insert("CD1_1", SCALE);
    let mirrored = Wcs::new(&header);
    assert_eq!(mirrored.is_flipped(), Some(false));
}

#[test]
fn test_invalid_headers() {
    let mut singular = tan_header("TAN", [150.0, 30.0]);
    singular.insert("CD2_2", 0.0);

    let mut unsupported = tan_header("TAN", [150.0, 30.0]);
    unsupported.insert("CTYPE1", "RA---CAR");
    unsupported.insert("CTYPE2", "DEC--CAR");

    let mut mismatched = tan_header("TAN", [150.0, 30.0]);
    mismatched.insert("CTYPE2", "DEC--SIN");

    let mut linear_only = tan_header("TAN", [150.0, 30.0]);
    linear_only.remove("CTYPE1");
    linear_only.remove("CTYPE2");

    let mut missing_reference = tan_header("TAN", [150.0, 30.0]);
    missing_reference.remove("CRVAL2");

    for header in [Header::new(), singular, unsupported, mismatched, linear_only, missing_reference] {
        let wcs = Wcs::new(&header);
        assert!(!wcs.is_valid());
        assert!(wcs.pix_to_world([1.0, 1.0]).is_none());
        assert!(wcs.world_to_pix([10.0, 30.0]).is_none());
        assert!(wcs.pixel_scale().is_none());
        assert!(wcs.is_flipped().is_none());
        assert!(wcs.position_angle().is_none());
        assert!(wcs.linear().is_none());
    }
}

#[test]
fn test_non_wcs_keywords_ignored() {
    let mut header = tan_header("TAN", [150.0, 30.0]);
    header.insert("OBJECT", "NGC 2903");
    header.insert("CRVAL1X", HeaderValue::Bool(true));
    let wcs = Wcs::new(&header);
    assert!(wcs.is_valid());
}

#[test]
fn test_sin_far_side_has_no_pixel() {
    let wcs = Wcs::new(&tan_header("SIN", [150.0, 30.0]));
    assert!(wcs.world_to_pix([330.0 / 15.0, -30.0]).is_none());
}

#[test]
fn test_galactic_axes_supported() {
    let mut header = tan_header("TAN", [120.0, 10.0]);
    header.insert("CTYPE1", "GLON-TAN");
    header.insert("CTYPE2", "GLAT-TAN");
    assert!(Wcs::new(&header).is_valid());
}

#[test]
fn test_has_overlap() {
    let size = [1000.0, 1000.0];
    let a = Wcs::new(&tan_header("TAN", [150.0, 30.0]));
    let near = Wcs::new(&tan_header("TAN", [150.05, 30.02]));
    let far = Wcs::new(&tan_header("TAN", [160.0, 30.0]));

    assert!(a.has_overlap(size, &near, size));
    assert!(!a.has_overlap(size, &far, size));
    assert!(!a.has_overlap(size, &Wcs::default(), size));
}

#[test]
fn test_custom_solver() {
    #[derive(Debug)]
    struct Shift;

    impl CelestialSolver for Shift {
        fn init(_cards: &str) -> Option<Self> {
            Some(Shift)
        }

        fn pix2sky(&self, [x, y]: [f64; 2]) -> Option<[f64; 2]> {
            Some([x + 15.0, y])
        }

        fn sky2pix(&self, [lon, lat]: [f64; 2]) -> Option<[f64; 2]> {
            Some([lon - 15.0, lat])
        }

        fn has_celestial(&self) -> bool {
            true
        }
    }

    let wcs = Wcs::with_solver::<Shift>(&Header::new());
    assert!(wcs.is_valid());
    assert_eq!(wcs.pix_to_world([0.0, 5.0]), Some([1.0, 5.0]));
    assert_eq!(wcs.world_to_pix([1.0, 5.0]), Some([0.0, 5.0]));
    assert!(wcs.pixel_scale().is_none());
}

#[test]
fn test_distorted_headers_are_rejected() {
    let mut sip = tan_header("TAN", [150.0, 30.0]);
    sip.insert("CTYPE1", "RA---TAN-SIP");
    sip.insert("CTYPE2", "DEC--TAN-SIP");

    let mut tpv = tan_header("TAN", [150.0, 30.0]);
    tpv.insert("PV1_1", 1.0);
    tpv.insert("PV2_2", 1.5e-3);

    for header in [sip, tpv] {
        let wcs = Wcs::new(&header);
        assert!(!wcs.is_valid(), "{header:?}");
        assert!(wcs.pix_to_world([500.5, 500.5]).is_none());
    }

    // Zero-valued parameters leave the projection unchanged.
    let mut zeroed = tan_header("TAN", [150.0, 30.0]);
    zeroed.insert("PV2_1", 0.0);
    assert!(Wcs::new(&zeroed).is_valid());
}

#[test]
fn test_distortion_keyword_scan() {
    let mut header = tan_header("TAN", [150.0, 30.0]);
    assert!(solver::distortion_keywords(&header).is_empty());

    header.insert("CTYPE1", "RA---TPV");
    header.insert("A_ORDER", 2_i64);
    header.insert("PV1_5", 2.0e-4);
    header.insert("PVX", 1.0);
    assert_eq!(
        solver::distortion_keywords(&header),
        vec!["A_ORDER".to_string(), "PV1_5".to_string()]
    );

    header.insert("CTYPE2", "DEC--TAN-SIP");
    assert!(solver::distortion_keywords(&header).contains(&"CTYPE2".to_string()));
}
